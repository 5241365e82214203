use std::fmt;

use serde::{Deserialize, Serialize};

/// Account identifier carried in the `account_id` claim.
/// The backend has issued both numeric and string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(untagged)]
pub enum AccountId {
    Number(i64),
    Text(String),
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountId::Number(n) => write!(f, "{}", n),
            AccountId::Text(s) => f.write_str(s),
        }
    }
}

/// Authorization claims derived from the backend-issued token.
///
/// Only used for local role/account decisions; this token is never sent
/// as a bearer credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub is_authenticated: bool,
    pub account_id: Option<AccountId>,
    pub role: Option<String>,
}

impl AuthState {
    /// The cleared triple: not authenticated, no account, no role.
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    pub fn authenticated(account_id: Option<AccountId>, role: Option<String>) -> Self {
        Self {
            is_authenticated: true,
            account_id,
            role,
        }
    }
}
