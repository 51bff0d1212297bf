//! Authenticated request/response client.
//!
//! Every business call gates on access-token freshness first, refreshing
//! through the injected [`AuthStore`] when needed, then attaches the bearer
//! credential and performs the call. Transient transport failures retry the
//! whole operation from the gate; only authorization failures and domain
//! rejections reach the caller and the dispatcher. The sign-in/sign-up flow
//! streams its response body because the server emits a short status line
//! before the token payload.

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthStore;
use crate::dispatch::{ClientEvent, Dispatcher};
use crate::retry::retry_transient;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Production base URL for the request/response API.
pub const API_BASE_URL: &str = "https://api.courierchat.io";
/// Local development base URL for the request/response API.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8080";

/// Caller-supplied request parameters, URL-encoded as query or form body.
///
/// Ordered so encodings are deterministic; building the right keys for each
/// operation is the caller's job.
pub type Params = BTreeMap<String, String>;

/// Business-rule rejection reported by the server.
///
/// The display strings are the user-facing messages the application shows
/// as-is.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("User not found!")]
    UserNotFound,

    #[error("Wrong password!")]
    WrongPassword,

    #[error("User already exists!")]
    UserAlreadyExists,

    #[error("Something went wrong, try again!")]
    SignRejected,

    #[error("This group already exists!")]
    GroupAlreadyExists,
}

/// Errors produced by the request/response client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level request failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The refresh token was rejected; the session cannot be kept alive.
    #[error("unauthorized: the refresh token was rejected")]
    Unauthorized,

    /// Business-rule rejection, not retried.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Unexpected HTTP status without a domain-specific meaning.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Response body did not match the expected shape.
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    /// Whether the failure is a transient transport condition.
    ///
    /// Transient failures are retried immediately and indefinitely and are
    /// never surfaced to the caller or the dispatcher.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_connect() || err.is_timeout(),
            Self::Unauthorized | Self::Domain(_) | Self::HttpStatus { .. } | Self::Parse(_) => {
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssuedTokenPair {
    access: String,
    refresh: String,
}

#[derive(Debug, Deserialize)]
struct RefreshedToken {
    access: String,
}

#[derive(Debug)]
enum SignProgress {
    /// Status line accepted; the token payload follows.
    Accepted,
    /// Payload chunk buffered.
    Buffering,
}

/// Two-state decoder for the streamed sign-in/sign-up response.
///
/// The server emits a status line as the first chunk and, on success, holds
/// the stream open until the token payload can be issued. The first chunk
/// classifies the outcome and is discarded; everything after it accumulates
/// until the stream ends.
enum SignDecoder {
    AwaitingStatus,
    Accumulating(Vec<u8>),
}

impl SignDecoder {
    fn new() -> Self {
        Self::AwaitingStatus
    }

    fn push(&mut self, chunk: &[u8]) -> Result<SignProgress, DomainError> {
        match self {
            Self::AwaitingStatus => {
                let status = normalize_stream_text(chunk);
                match status.as_str() {
                    "Not Found" => Err(DomainError::UserNotFound),
                    "Forbidden" => Err(DomainError::WrongPassword),
                    "Conflict" => Err(DomainError::UserAlreadyExists),
                    "Unprocessable Entity" => Err(DomainError::SignRejected),
                    _ => {
                        *self = Self::Accumulating(Vec::new());
                        Ok(SignProgress::Accepted)
                    }
                }
            }
            Self::Accumulating(buffer) => {
                buffer.extend_from_slice(chunk);
                Ok(SignProgress::Buffering)
            }
        }
    }

    fn finish(self) -> Result<IssuedTokenPair, ApiError> {
        let Self::Accumulating(buffer) = self else {
            return Err(ApiError::Parse(
                "response ended before a status line arrived".to_string(),
            ));
        };
        let body = normalize_stream_text(&buffer);
        serde_json::from_str(&body)
            .map_err(|err| ApiError::Parse(format!("token payload: {err}")))
    }
}

/// Strips `data:` event prefixes and collapses whitespace.
fn normalize_stream_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace("data:", "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

fn decode_body(status: StatusCode, body: String) -> Result<Value, ApiError> {
    if !status.is_success() {
        return Err(ApiError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }
    serde_json::from_str(&body).map_err(|err| ApiError::Parse(err.to_string()))
}

/// Request/response client with transparent access-token refresh.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    auth: Arc<dyn AuthStore>,
    dispatcher: Arc<dyn Dispatcher>,
    local: bool,
    endpoint_override: Option<String>,
}

impl ApiClient {
    /// Creates a client for production mode.
    pub fn new(
        auth: Arc<dyn AuthStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .no_proxy()
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            auth,
            dispatcher,
            local: false,
            endpoint_override: None,
        })
    }

    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit base URL override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.endpoint_override = Some(base_url.trim().trim_end_matches('/').to_string());
        self
    }

    fn base_url(&self) -> &str {
        if let Some(base_url) = self.endpoint_override.as_deref() {
            return base_url;
        }
        if self.local {
            LOCAL_API_BASE_URL
        } else {
            API_BASE_URL
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    /// Signs an existing user in; the issued token pair is stored through
    /// the `AuthStore`.
    pub async fn sign_in(&self, credentials: &Params) -> Result<(), ApiError> {
        self.sign(credentials, "/sign/in").await
    }

    /// Registers a new user; otherwise identical to [`Self::sign_in`].
    pub async fn sign_up(&self, credentials: &Params) -> Result<(), ApiError> {
        self.sign(credentials, "/sign/up").await
    }

    async fn sign(&self, credentials: &Params, path: &str) -> Result<(), ApiError> {
        let result = retry_transient(
            || self.sign_attempt(credentials, path),
            ApiError::is_transient,
        )
        .await;
        self.report(result)
    }

    async fn sign_attempt(&self, credentials: &Params, path: &str) -> Result<(), ApiError> {
        let mut response = self
            .http
            .post(self.endpoint(path))
            .form(credentials)
            .send()
            .await?;

        let mut decoder = SignDecoder::new();
        while let Some(chunk) = response.chunk().await? {
            match decoder.push(&chunk) {
                Ok(SignProgress::Accepted) => {
                    self.dispatcher.dispatch(ClientEvent::SignAccepted);
                }
                Ok(SignProgress::Buffering) => {}
                Err(rejection) => return Err(ApiError::Domain(rejection)),
            }
        }

        let issued = decoder.finish()?;
        self.auth.set_both_tokens(
            SecretString::new(issued.access),
            SecretString::new(issued.refresh),
        );
        Ok(())
    }

    /// Validates the persisted refresh token at startup.
    ///
    /// Unlike the in-session refresh exchange, the server also checks the
    /// token's expiry here: a stale persisted session must not come back to
    /// life. Any reachable response other than 401 counts as valid — a
    /// failing server must not log the user out.
    pub async fn check_refresh_token(&self) -> Result<(), ApiError> {
        let result =
            retry_transient(|| self.check_refresh_attempt(), ApiError::is_transient).await;
        if matches!(result, Err(ApiError::Unauthorized)) {
            self.dispatcher.dispatch(ClientEvent::Unauthorized);
        }
        result
    }

    async fn check_refresh_attempt(&self) -> Result<(), ApiError> {
        let refresh = self.auth.refresh_token();
        let mut query = Params::new();
        query.insert("refresh".to_string(), refresh.expose_secret().to_string());

        let response = self
            .http
            .get(self.endpoint("/sign/check-refresh"))
            .query(&query)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        Ok(())
    }

    /// Creates a group. Status 409 means the name is taken.
    pub async fn create_group(&self, group: &Params) -> Result<Value, ApiError> {
        let result = retry_transient(
            || async move {
                let (status, body) = self.post_authorized("/create/group", group).await?;
                if status == StatusCode::CONFLICT {
                    return Err(ApiError::Domain(DomainError::GroupAlreadyExists));
                }
                decode_body(status, body)
            },
            ApiError::is_transient,
        )
        .await;
        self.report(result)
    }

    /// Searches users and groups matching the caller-supplied filter.
    pub async fn find_chats(&self, filter: &Params) -> Result<Value, ApiError> {
        self.get_decoded("/api/find", filter).await
    }

    /// Lists the chats the signed-in user participates in.
    pub async fn chats(&self) -> Result<Value, ApiError> {
        self.get_decoded("/api/chats", &Params::new()).await
    }

    /// Fetches a page of direct-dialogue message history.
    pub async fn dialogue_messages(&self, filter: &Params) -> Result<Value, ApiError> {
        self.get_decoded("/messages/dialogue", filter).await
    }

    /// Fetches a page of group message history.
    pub async fn group_messages(&self, filter: &Params) -> Result<Value, ApiError> {
        self.get_decoded("/messages/group", filter).await
    }

    async fn get_decoded(&self, path: &str, query: &Params) -> Result<Value, ApiError> {
        let result = retry_transient(
            || async move {
                let (status, body) = self.get_authorized(path, query).await?;
                decode_body(status, body)
            },
            ApiError::is_transient,
        )
        .await;
        self.report(result)
    }

    async fn get_authorized(
        &self,
        path: &str,
        query: &Params,
    ) -> Result<(StatusCode, String), ApiError> {
        self.ensure_fresh_access_token().await?;
        let access = self.auth.access_token();

        let response = self
            .http
            .get(self.endpoint(path))
            .query(query)
            .bearer_auth(access.expose_secret())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    async fn post_authorized(
        &self,
        path: &str,
        form: &Params,
    ) -> Result<(StatusCode, String), ApiError> {
        self.ensure_fresh_access_token().await?;
        let access = self.auth.access_token();

        let response = self
            .http
            .post(self.endpoint(path))
            .form(form)
            .bearer_auth(access.expose_secret())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    /// Token-freshness gate run before every authenticated call.
    ///
    /// A rejected refresh token aborts the pending operation before any of
    /// its bytes are sent and notifies the dispatcher exactly once.
    async fn ensure_fresh_access_token(&self) -> Result<(), ApiError> {
        if !self.auth.is_access_token_expired() {
            return Ok(());
        }

        match retry_transient(|| self.refresh_attempt(), ApiError::is_transient).await {
            Ok(()) => Ok(()),
            Err(ApiError::Unauthorized) => {
                self.dispatcher.dispatch(ClientEvent::Unauthorized);
                Err(ApiError::Unauthorized)
            }
            Err(other) => Err(other),
        }
    }

    async fn refresh_attempt(&self) -> Result<(), ApiError> {
        let refresh = self.auth.refresh_token();
        let mut form = Params::new();
        form.insert("refresh".to_string(), refresh.expose_secret().to_string());

        let response = self
            .http
            .post(self.endpoint("/sign/refresh"))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }

        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        let issued: RefreshedToken =
            serde_json::from_str(&body).map_err(|err| ApiError::Parse(err.to_string()))?;
        self.auth.set_access_token(SecretString::new(issued.access));
        Ok(())
    }

    /// Forwards domain rejections to the dispatcher alongside the returned
    /// error.
    fn report<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if let Err(ApiError::Domain(rejection)) = &result {
            self.dispatcher.dispatch(ClientEvent::Rejected(rejection.clone()));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        decode_body, normalize_stream_text, ApiClient, ApiError, DomainError, SignDecoder,
        SignProgress, API_BASE_URL, LOCAL_API_BASE_URL,
    };
    use crate::auth::{MemoryAuthStore, TokenPair};
    use crate::dispatch::ClientEvent;
    use reqwest::StatusCode;

    fn test_client() -> ApiClient {
        let auth = Arc::new(MemoryAuthStore::new(TokenPair::new("access", "refresh")));
        ApiClient::new(auth, Arc::new(|_: ClientEvent| {})).expect("build client")
    }

    #[test]
    fn api_client_uses_production_base_url_by_default() {
        assert_eq!(test_client().base_url(), API_BASE_URL);
    }

    #[test]
    fn api_client_uses_local_base_url_when_enabled() {
        assert_eq!(
            test_client().with_local_mode(true).base_url(),
            LOCAL_API_BASE_URL
        );
    }

    #[test]
    fn api_client_base_url_override_takes_precedence() {
        let client = test_client()
            .with_local_mode(true)
            .with_base_url("http://127.0.0.1:9999/ ");
        assert_eq!(client.base_url(), "http://127.0.0.1:9999");
    }

    #[test]
    fn stream_text_normalization_strips_event_prefixes() {
        assert_eq!(normalize_stream_text(b"data: Not Found\n\n"), "Not Found");
        assert_eq!(normalize_stream_text(b"  Forbidden "), "Forbidden");
    }

    #[test]
    fn sign_decoder_classifies_rejections_from_the_first_chunk() {
        let cases = [
            (&b"data: Not Found\n\n"[..], DomainError::UserNotFound),
            (&b"Forbidden"[..], DomainError::WrongPassword),
            (&b"data: Conflict"[..], DomainError::UserAlreadyExists),
            (&b"Unprocessable Entity"[..], DomainError::SignRejected),
        ];
        for (chunk, expected) in cases {
            let mut decoder = SignDecoder::new();
            let rejection = decoder.push(chunk).expect_err("must reject");
            assert_eq!(rejection, expected);
        }
    }

    #[test]
    fn sign_decoder_accepts_then_accumulates_the_token_payload() {
        let mut decoder = SignDecoder::new();

        assert!(matches!(
            decoder.push(b"data: Created\n\n").expect("status accepted"),
            SignProgress::Accepted
        ));
        assert!(matches!(
            decoder
                .push(br#"data: {"access":"a-token","#)
                .expect("buffered"),
            SignProgress::Buffering
        ));
        assert!(matches!(
            decoder.push(br#" "refresh":"r-token"}"#).expect("buffered"),
            SignProgress::Buffering
        ));

        let issued = decoder.finish().expect("token payload parses");
        assert_eq!(issued.access, "a-token");
        assert_eq!(issued.refresh, "r-token");
    }

    #[test]
    fn sign_decoder_discards_the_status_chunk_itself() {
        let mut decoder = SignDecoder::new();
        decoder.push(b"data: Created").expect("accepted");
        decoder
            .push(br#"{"access":"a","refresh":"r"}"#)
            .expect("buffered");

        let issued = decoder.finish().expect("parses without the status text");
        assert_eq!(issued.access, "a");
    }

    #[test]
    fn sign_decoder_rejects_a_stream_that_ends_before_the_status() {
        let decoder = SignDecoder::new();
        assert!(matches!(decoder.finish(), Err(ApiError::Parse(_))));
    }

    #[test]
    fn rejection_messages_are_stable() {
        assert_eq!(DomainError::UserNotFound.to_string(), "User not found!");
        assert_eq!(DomainError::WrongPassword.to_string(), "Wrong password!");
        assert_eq!(
            DomainError::UserAlreadyExists.to_string(),
            "User already exists!"
        );
        assert_eq!(
            DomainError::GroupAlreadyExists.to_string(),
            "This group already exists!"
        );
    }

    #[test]
    fn non_transient_errors_are_terminal() {
        assert!(!ApiError::Unauthorized.is_transient());
        assert!(!ApiError::Domain(DomainError::GroupAlreadyExists).is_transient());
        assert!(!ApiError::Parse("bad".to_string()).is_transient());
    }

    #[test]
    fn unexpected_statuses_become_http_status_errors() {
        let err = decode_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error":"boom"}"#.to_string(),
        )
        .expect_err("5xx is an error");
        match err {
            ApiError::HttpStatus { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn successful_bodies_decode_as_json() {
        let value =
            decode_body(StatusCode::OK, r#"[{"id":1}]"#.to_string()).expect("array decodes");
        assert_eq!(value[0]["id"], 1);
    }
}
