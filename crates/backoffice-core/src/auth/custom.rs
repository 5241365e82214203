//! Backend-issued credential flow.
//!
//! The backend signs a JWT after a successful credential exchange. The console
//! only decodes it locally to learn the operator's account and role; it is
//! never attached to outgoing requests.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::claims::{decode_payload, CustomClaims};
use crate::models::{AuthState, Profile};
use crate::storage::{keys, TokenStore};

pub struct CustomSession {
    store: Arc<dyn TokenStore>,
    auth: AuthState,
    profile: Profile,
}

impl CustomSession {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            store,
            auth: AuthState::unauthenticated(),
            profile: Profile::default(),
        }
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// The persisted backend token, if any
    pub fn access_token(&self) -> Option<String> {
        self.store.get(keys::ACCESS_TOKEN).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read access token");
            None
        })
    }

    /// Rebuild the auth state from the persisted token at startup.
    ///
    /// Never fails: a missing, malformed or expired token yields the
    /// unauthenticated triple and clears every custom storage key.
    pub fn restore(&mut self) -> &AuthState {
        match self.access_token() {
            Some(token) => {
                debug!("Restoring backend session from stored token");
                self.login(&token)
            }
            None => {
                debug!("No stored backend token");
                self.clear();
                &self.auth
            }
        }
    }

    /// Accept a freshly issued token.
    ///
    /// The token is persisted only when it decodes and its `exp` lies in the
    /// future. Anything else resets to unauthenticated with storage cleared.
    pub fn login(&mut self, token: &str) -> &AuthState {
        let claims = match decode_payload::<CustomClaims>(token) {
            Ok(claims) => claims,
            Err(e) => {
                warn!(error = %e, "Failed to decode backend token");
                self.clear();
                return &self.auth;
            }
        };

        if !claims.is_unexpired() {
            info!(exp = ?claims.exp, "Backend token is expired");
            self.clear();
            return &self.auth;
        }

        if let Err(e) = self.store.set(keys::ACCESS_TOKEN, token) {
            warn!(error = %e, "Failed to persist backend token; session will not survive restart");
        }
        self.auth = AuthState::authenticated(claims.account_id, claims.role);
        self.load_cached_profile();

        info!(
            account_id = ?self.auth.account_id.as_ref().map(|a| a.to_string()),
            role = ?self.auth.role,
            "Backend session authenticated"
        );
        &self.auth
    }

    /// Drop every custom credential, locally and in storage
    pub fn logout(&mut self) {
        self.clear();
        info!("Backend session logged out");
    }

    /// Replace the cached profile (after a live fetch)
    pub fn cache_profile(&mut self, profile: Profile) {
        if !self.auth.is_authenticated {
            debug!("Ignoring profile for unauthenticated session");
            return;
        }
        match serde_json::to_string(&profile) {
            Ok(json) => {
                if let Err(e) = self.store.set(keys::PROFILE, &json) {
                    warn!(error = %e, "Failed to cache profile");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize profile"),
        }
        self.profile = profile;
    }

    fn load_cached_profile(&mut self) {
        let cached = match self.store.get(keys::PROFILE) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "Failed to read cached profile");
                return;
            }
        };

        if let Some(json) = cached {
            match serde_json::from_str::<Profile>(&json) {
                Ok(profile) => self.profile = profile,
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable cached profile");
                    let _ = self.store.remove(keys::PROFILE);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.auth = AuthState::unauthenticated();
        self.profile = Profile::default();
        if let Err(e) = self.store.remove_all(&keys::CUSTOM_KEYS) {
            warn!(error = %e, "Failed to clear backend credentials from storage");
        }
    }
}
