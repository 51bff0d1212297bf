//! Event sink contract for inbound frames and failure notifications.
//!
//! The embedding application supplies the [`Dispatcher`]; the SDK pushes
//! realtime frames and cross-cutting failures into it. Any
//! `Fn(ClientEvent)` closure works, and [`ChannelDispatcher`] adapts the
//! sink to a tokio channel for event-loop style consumers.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::DomainError;

/// Event delivered to the application's dispatcher.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// Inbound realtime frame, forwarded verbatim (acknowledgments are
    /// filtered out before this point).
    Frame(Value),
    /// The refresh token was rejected; the user must sign in again.
    Unauthorized,
    /// A request was rejected by a business rule.
    Rejected(DomainError),
    /// The sign flow's status line reported success; the token payload
    /// follows once the account is confirmed.
    SignAccepted,
}

/// Receives [`ClientEvent`]s from both transports.
pub trait Dispatcher: Send + Sync + 'static {
    /// Delivers one event. Must not block.
    fn dispatch(&self, event: ClientEvent);
}

impl<F> Dispatcher for F
where
    F: Fn(ClientEvent) + Send + Sync + 'static,
{
    fn dispatch(&self, event: ClientEvent) {
        self(event);
    }
}

/// [`Dispatcher`] that forwards events into an unbounded channel.
///
/// Delivery is best-effort: events sent after the receiver is dropped are
/// discarded.
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelDispatcher {
    /// Creates the dispatcher together with its receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ChannelDispatcher, ClientEvent, Dispatcher};

    #[tokio::test]
    async fn channel_dispatcher_forwards_events_in_order() {
        let (dispatcher, mut rx) = ChannelDispatcher::new();
        dispatcher.dispatch(ClientEvent::Frame(json!({"method": "newMessage"})));
        dispatcher.dispatch(ClientEvent::Unauthorized);

        match rx.recv().await.expect("first event") {
            ClientEvent::Frame(frame) => assert_eq!(frame["method"], "newMessage"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.expect("second event"),
            ClientEvent::Unauthorized
        ));
    }

    #[test]
    fn dropped_receiver_discards_events() {
        let (dispatcher, rx) = ChannelDispatcher::new();
        drop(rx);
        dispatcher.dispatch(ClientEvent::SignAccepted);
    }
}
