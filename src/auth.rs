//! Token storage contract shared by the realtime and request clients.
//!
//! The SDK doesn't persist credentials itself — that's the embedding
//! application's job (keychain, encrypted file, whatever the platform
//! offers). It only defines the [`AuthStore`] trait both clients read
//! through, plus [`MemoryAuthStore`] for tests and development.

use std::sync::RwLock;
use std::time::SystemTime;

use secrecy::SecretString;

/// Access/refresh token pair issued by the sign endpoints.
pub struct TokenPair {
    /// Short-lived bearer credential attached to authenticated calls.
    pub access: SecretString,
    /// Longer-lived credential used to obtain a new access token.
    pub refresh: SecretString,
}

impl TokenPair {
    /// Builds a pair from plain strings.
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: SecretString::new(access.into()),
            refresh: SecretString::new(refresh.into()),
        }
    }
}

/// Read/write access to the current token pair.
///
/// Implementations must use interior mutability: both clients hold the store
/// behind an `Arc` and call setters through `&self`. The request client
/// consults `is_access_token_expired` before every call and never caches
/// tokens on its own.
pub trait AuthStore: Send + Sync + 'static {
    /// Whether the access token is past its validity window.
    fn is_access_token_expired(&self) -> bool;

    /// Current access token.
    fn access_token(&self) -> SecretString;

    /// Current refresh token.
    fn refresh_token(&self) -> SecretString;

    /// Replaces the access token after a refresh exchange.
    fn set_access_token(&self, access: SecretString);

    /// Replaces both tokens after a completed sign-in or sign-up.
    fn set_both_tokens(&self, access: SecretString, refresh: SecretString);
}

struct MemoryAuthState {
    access: SecretString,
    refresh: SecretString,
    access_expires_at: Option<SystemTime>,
}

/// In-memory [`AuthStore`] for tests and development.
///
/// Never use this in a shipping client — tokens vanish with the process.
pub struct MemoryAuthStore {
    inner: RwLock<MemoryAuthState>,
}

impl MemoryAuthStore {
    /// Creates a store whose access token never expires on its own.
    pub fn new(tokens: TokenPair) -> Self {
        Self::with_expiry(tokens, None)
    }

    /// Creates a store with an explicit access-token expiry instant.
    pub fn with_expiry(tokens: TokenPair, access_expires_at: Option<SystemTime>) -> Self {
        Self {
            inner: RwLock::new(MemoryAuthState {
                access: tokens.access,
                refresh: tokens.refresh,
                access_expires_at,
            }),
        }
    }

    /// Forces the access token into the expired state.
    pub fn expire_access_token(&self) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        state.access_expires_at = Some(SystemTime::UNIX_EPOCH);
    }
}

impl AuthStore for MemoryAuthStore {
    fn is_access_token_expired(&self) -> bool {
        let state = self.inner.read().unwrap_or_else(|err| err.into_inner());
        match state.access_expires_at {
            Some(expires_at) => expires_at <= SystemTime::now(),
            None => false,
        }
    }

    fn access_token(&self) -> SecretString {
        self.inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .access
            .clone()
    }

    fn refresh_token(&self) -> SecretString {
        self.inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .refresh
            .clone()
    }

    fn set_access_token(&self, access: SecretString) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        state.access = access;
        state.access_expires_at = None;
    }

    fn set_both_tokens(&self, access: SecretString, refresh: SecretString) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        state.access = access;
        state.refresh = refresh;
        state.access_expires_at = None;
    }
}
