//! The seam between the session manager and an OpenID Connect provider.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::pkce::PkceChallenge;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Identity provider request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Identity provider rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Identity provider returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("No authenticated identity session")]
    NotAuthenticated,

    #[error("Identity token needs a refresh but no refresh token is held")]
    MissingRefreshToken,

    #[error("Operation not supported by this identity provider: {0}")]
    Unsupported(&'static str),
}

/// How initialization treats a missing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnLoad {
    /// Detect an existing session without an interactive redirect
    CheckSso,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkceMethod {
    S256,
}

impl PkceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PkceMethod::S256 => "S256",
        }
    }
}

/// Access/refresh/id token triple issued by the provider.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Options for the initialization handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct InitOptions {
    pub on_load: OnLoad,
    pub silent_check_sso_redirect_uri: String,
    pub check_login_iframe: bool,
    pub pkce_method: PkceMethod,
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
}

impl InitOptions {
    /// Non-interactive SSO check with PKCE and no iframe polling
    pub fn check_sso(silent_check_sso_redirect_uri: impl Into<String>) -> Self {
        Self {
            on_load: OnLoad::CheckSso,
            silent_check_sso_redirect_uri: silent_check_sso_redirect_uri.into(),
            check_login_iframe: false,
            pkce_method: PkceMethod::S256,
            token: None,
            refresh_token: None,
            id_token: None,
        }
    }

    /// Seed the handshake with previously persisted tokens
    pub fn with_seeds(
        mut self,
        token: Option<String>,
        refresh_token: Option<String>,
        id_token: Option<String>,
    ) -> Self {
        self.token = token;
        self.refresh_token = refresh_token;
        self.id_token = id_token;
        self
    }

    pub fn has_seeds(&self) -> bool {
        self.token.is_some() && self.refresh_token.is_some()
    }
}

impl fmt::Debug for InitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitOptions")
            .field("on_load", &self.on_load)
            .field("silent_check_sso_redirect_uri", &self.silent_check_sso_redirect_uri)
            .field("check_login_iframe", &self.check_login_iframe)
            .field("pkce_method", &self.pkce_method)
            .field("seeded", &self.has_seeds())
            .finish()
    }
}

/// An OpenID Connect provider as seen by the identity session.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Run the initialization handshake.
    ///
    /// `Ok(Some(_))` means an authenticated session was established,
    /// `Ok(None)` that the provider answered but no session exists.
    async fn init(&self, options: &InitOptions) -> Result<Option<TokenSet>, IdentityError>;

    /// Exchange a refresh token for a new token triple
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IdentityError>;

    /// End the provider-side session
    async fn logout(&self, tokens: Option<&TokenSet>) -> Result<(), IdentityError>;

    /// URL that starts an interactive authorization-code login
    fn authorization_url(
        &self,
        _pkce: &PkceChallenge,
        _state: &str,
        _redirect_uri: &str,
    ) -> Result<String, IdentityError> {
        Err(IdentityError::Unsupported("interactive login"))
    }

    /// Redeem an authorization code from an interactive login
    async fn exchange_code(
        &self,
        _code: &str,
        _verifier: &str,
        _redirect_uri: &str,
    ) -> Result<TokenSet, IdentityError> {
        Err(IdentityError::Unsupported("interactive login"))
    }
}
