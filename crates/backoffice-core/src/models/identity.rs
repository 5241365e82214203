use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of the identity-provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Authenticated,
    Refreshing,
    /// Terminal until the next login
    Unauthenticated,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Authenticated => "authenticated",
            SessionState::Refreshing => "refreshing",
            SessionState::Unauthenticated => "unauthenticated",
        }
    }
}

/// Point-in-time view of the identity-provider session.
///
/// `loading` stays true until the initialization handshake resolves; while it
/// is set, consumers must treat the authentication state as unknown.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentitySnapshot {
    pub state: SessionState,
    pub authenticated: bool,
    pub loading: bool,
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
}

impl Default for IdentitySnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Uninitialized,
            authenticated: false,
            loading: true,
            token: None,
            refresh_token: None,
            id_token: None,
        }
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for IdentitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(v: &Option<String>) -> &'static str {
            if v.is_some() { "<redacted>" } else { "None" }
        }
        f.debug_struct("IdentitySnapshot")
            .field("state", &self.state)
            .field("authenticated", &self.authenticated)
            .field("loading", &self.loading)
            .field("token", &redact(&self.token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("id_token", &redact(&self.id_token))
            .finish()
    }
}

/// User details read from the identity-provider access token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ProviderUser {
    pub id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub roles: Vec<String>,
}
