//! The session manager: one owned object holding both credential flows.
//!
//! Consumers read state through accessors and change it only through the
//! action methods here; no field is exposed for mutation.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use tracing::{debug, info, warn};

use super::custom::CustomSession;
use super::identity::{IdentitySession, PendingLogin, FORCE_MIN_VALIDITY_SECS};
use super::keycloak::KeycloakClient;
use super::provider::{IdentityError, IdentityProvider, InitOptions};
use crate::api::{ApiClient, BearerSource};
use crate::config::Config;
use crate::models::{AuthState, IdentitySnapshot, Profile, ProviderUser};
use crate::storage::TokenStore;

/// Where a protected screen should go, derived from the identity session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthGate {
    /// Handshake still running; do not redirect yet
    Loading,
    /// Offer a login
    Unauthenticated,
    Authenticated,
}

pub struct SessionManager {
    custom: RwLock<CustomSession>,
    identity: Arc<IdentitySession>,
    profile_fetch: bool,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        provider: Arc<dyn IdentityProvider>,
        init_options: InitOptions,
    ) -> Self {
        Self {
            custom: RwLock::new(CustomSession::new(store.clone())),
            identity: Arc::new(IdentitySession::new(provider, store, init_options)),
            profile_fetch: false,
        }
    }

    /// Build a manager talking to the configured Keycloak realm
    pub fn from_config(config: &Config, store: Arc<dyn TokenStore>) -> Result<Self> {
        let provider = KeycloakClient::new(config.identity())?;
        let options = InitOptions::check_sso(config.silent_check_sso_redirect_uri());
        Ok(Self::new(store, Arc::new(provider), options).with_profile_fetch(config.profile_fetch))
    }

    /// Fetch the profile from the backend when the cache is empty
    pub fn with_profile_fetch(mut self, enabled: bool) -> Self {
        self.profile_fetch = enabled;
        self
    }

    fn custom(&self) -> RwLockReadGuard<'_, CustomSession> {
        self.custom.read().unwrap_or_else(|e| e.into_inner())
    }

    fn custom_mut(&self) -> RwLockWriteGuard<'_, CustomSession> {
        self.custom.write().unwrap_or_else(|e| e.into_inner())
    }

    // ===== Startup =====

    /// Restore the backend session and run the provider handshake together.
    /// Neither depends on the other finishing first.
    pub async fn bootstrap(&self) {
        futures::join!(
            async {
                self.restore_custom_session();
            },
            self.init_identity_session(),
        );
        debug!(gate = ?self.gate(), "Session bootstrap complete");
    }

    // ===== Backend-issued credentials =====

    pub fn restore_custom_session(&self) -> AuthState {
        self.custom_mut().restore().clone()
    }

    pub fn login_custom(&self, token: &str) -> AuthState {
        self.custom_mut().login(token).clone()
    }

    pub fn logout_custom(&self) {
        self.custom_mut().logout();
    }

    /// Tell the backend about the logout, then always clear locally.
    pub async fn logout(&self, api: &ApiClient) {
        let token = self.custom().access_token();
        if let Some(token) = token {
            if let Err(e) = api.logout(&token).await {
                warn!(error = %e, "Server logout failed; clearing local session anyway");
            }
        }
        self.logout_custom();
    }

    pub fn auth(&self) -> AuthState {
        self.custom().auth().clone()
    }

    pub fn profile(&self) -> Profile {
        self.custom().profile().clone()
    }

    /// Cached profile, fetched from the backend first when enabled and missing
    pub async fn load_profile(&self, api: &ApiClient) -> Profile {
        let (authenticated, cached) = {
            let custom = self.custom();
            (custom.auth().is_authenticated, custom.profile().clone())
        };
        if !authenticated || !cached.is_empty() || !self.profile_fetch {
            return cached;
        }

        match api.fetch_profile().await {
            Ok(profile) => {
                info!("Fetched operator profile");
                self.custom_mut().cache_profile(profile.clone());
                profile
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch profile");
                cached
            }
        }
    }

    // ===== Identity-provider credentials =====

    pub async fn init_identity_session(&self) {
        self.identity.init().await;
    }

    pub fn identity(&self) -> IdentitySnapshot {
        self.identity.snapshot()
    }

    pub fn identity_session(&self) -> &Arc<IdentitySession> {
        &self.identity
    }

    /// The bearer hook for the API client
    pub fn bearer_source(&self) -> Arc<dyn BearerSource> {
        self.identity.clone()
    }

    /// The identity-provider access token; the backend token is never used here
    pub fn active_bearer_token(&self) -> Option<String> {
        self.identity.bearer_token()
    }

    pub fn provider_user(&self) -> Option<ProviderUser> {
        self.identity.user()
    }

    pub fn gate(&self) -> AuthGate {
        let snapshot = self.identity.snapshot();
        if snapshot.loading {
            AuthGate::Loading
        } else if snapshot.authenticated {
            AuthGate::Authenticated
        } else {
            AuthGate::Unauthenticated
        }
    }

    /// Refresh the provider token unless it is valid for a few more seconds
    pub async fn force_refresh(&self) -> Result<bool, IdentityError> {
        self.identity.update_token(FORCE_MIN_VALIDITY_SECS).await
    }

    pub fn begin_sso_login(&self, redirect_uri: &str) -> Result<PendingLogin, IdentityError> {
        self.identity.begin_login(redirect_uri)
    }

    pub async fn complete_sso_login(
        &self,
        pending: &PendingLogin,
        code: &str,
        state: &str,
    ) -> Result<(), IdentityError> {
        self.identity.complete_login(pending, code, state).await
    }

    pub async fn sso_logout(&self) {
        self.identity.logout().await;
    }

    /// Sign out of the provider and start a login as a different operator
    pub async fn sso_switch_account(&self, redirect_uri: &str) -> Result<PendingLogin, IdentityError> {
        self.identity.logout_and_begin_login(redirect_uri).await
    }

    /// Stop background refresh work
    pub fn shutdown(&self) {
        self.identity.shutdown();
    }
}
