//! Local JWT payload decoding.
//!
//! Tokens are decoded without signature verification: the console only reads
//! claims for display and authorization hints. The backend and the identity
//! provider verify signatures on every request.

use chrono::Utc;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{AccountId, ProviderUser};

#[derive(Error, Debug)]
pub enum TokenDecodeError {
    #[error("Failed to decode JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Read the claims of a compact JWT into `T` without checking its signature.
///
/// Expiry is left to the caller, and no registered claim is required.
pub fn decode_payload<T: DeserializeOwned>(token: &str) -> Result<T, TokenDecodeError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let decoded = decode::<T>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(decoded.claims)
}

/// Claims of the backend-issued token
#[derive(Debug, Clone, Deserialize)]
pub struct CustomClaims {
    pub exp: Option<i64>,
    pub account_id: Option<AccountId>,
    pub role: Option<String>,
}

impl CustomClaims {
    /// A token without `exp` is never considered valid.
    pub fn is_unexpired(&self) -> bool {
        self.exp
            .map(|exp| exp.saturating_mul(1000) > Utc::now().timestamp_millis())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Claims of an identity-provider access token
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderClaims {
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub sub: Option<String>,
    pub preferred_username: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    #[serde(default)]
    pub realm_access: Option<RealmAccess>,
}

impl ProviderClaims {
    pub fn user(&self) -> ProviderUser {
        ProviderUser {
            id: self.sub.clone(),
            username: self.preferred_username.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            first_name: self.given_name.clone(),
            last_name: self.family_name.clone(),
            roles: self
                .realm_access
                .as_ref()
                .map(|r| r.roles.clone())
                .unwrap_or_default(),
        }
    }
}
