//! Identity-provider session.
//!
//! Owns the provider token triple for the lifetime of the console: restores it
//! from storage through the provider handshake, keeps it fresh with a polling
//! loop and an expiry timer, reacts to provider events, and tears everything
//! down on logout or refresh failure.
//!
//! All refreshes go through one async lock, so a polling tick, an expiry event
//! and a rejected request that fire together cause at most one token exchange.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::claims::{decode_payload, ProviderClaims};
use super::pkce::{generate_state, PkceChallenge};
use super::provider::{IdentityError, IdentityProvider, InitOptions, TokenSet};
use crate::api::BearerSource;
use crate::models::{IdentitySnapshot, ProviderUser, SessionState};
use crate::storage::{keys, TokenStore};

/// How often the polling loop checks the access token
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Polling refreshes when the token expires within this many seconds
pub const POLL_MIN_VALIDITY_SECS: i64 = 60;

/// A token-expired event refreshes when the token expires within this many seconds
pub const EXPIRED_MIN_VALIDITY_SECS: i64 = 30;

/// Minimum validity for an operator-requested refresh
pub const FORCE_MIN_VALIDITY_SECS: i64 = 5;

/// Signals raised by the provider side of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityEvent {
    /// The access token expired or a request was rejected with it
    TokenExpired,
    /// A logout already happened elsewhere; just forget the tokens
    AuthLogout,
}

/// Cloneable handle for raising [`IdentityEvent`]s.
#[derive(Clone)]
pub struct IdentityEvents {
    tx: mpsc::UnboundedSender<IdentityEvent>,
}

impl IdentityEvents {
    pub fn send(&self, event: IdentityEvent) {
        if self.tx.send(event).is_err() {
            debug!(?event, "Identity session is gone; dropping event");
        }
    }
}

/// An interactive login waiting for the provider's redirect.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub url: String,
    pub redirect_uri: String,
    state: String,
    verifier: String,
}

impl PendingLogin {
    /// Pull `code` and `state` out of the URL the provider redirected to
    pub fn parse_callback(callback_url: &str) -> Result<(String, String), IdentityError> {
        let url = Url::parse(callback_url)
            .map_err(|e| IdentityError::InvalidResponse(format!("Invalid callback URL: {}", e)))?;

        let mut code = None;
        let mut state = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => {
                    return Err(IdentityError::Rejected {
                        status: 400,
                        body: value.into_owned(),
                    })
                }
                _ => {}
            }
        }

        match (code, state) {
            (Some(code), Some(state)) => Ok((code, state)),
            _ => Err(IdentityError::InvalidResponse(
                "Callback URL has no code/state".to_string(),
            )),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn TokenStore>,
    init_options: InitOptions,
    state: watch::Sender<IdentitySnapshot>,
    /// Local clock minus provider clock, in seconds, measured from `iat`
    time_skew: Mutex<i64>,
    refresh_lock: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<IdentityEvent>,
    expiry_timer: Mutex<Option<AbortHandle>>,
}

impl Inner {
    fn snapshot(&self) -> IdentitySnapshot {
        self.state.borrow().clone()
    }

    fn read_seed(&self, key: &str) -> Option<String> {
        self.store.get(key).unwrap_or_else(|e| {
            warn!(key, error = %e, "Failed to read stored identity token");
            None
        })
    }

    fn persist_tokens(&self, tokens: &TokenSet) {
        let changes = [
            (keys::KC_TOKEN, Some(tokens.token.as_str())),
            (keys::KC_REFRESH_TOKEN, tokens.refresh_token.as_deref()),
            (keys::KC_ID_TOKEN, tokens.id_token.as_deref()),
        ];
        if let Err(e) = self.store.apply(&changes) {
            warn!(error = %e, "Failed to persist identity tokens");
        }
    }

    fn clear_stored_tokens(&self) {
        if let Err(e) = self.store.remove_all(&keys::IDENTITY_KEYS) {
            warn!(error = %e, "Failed to clear identity tokens from storage");
        }
    }

    /// Install a token triple as the authenticated session
    fn accept_tokens(&self, tokens: TokenSet) {
        let claims = decode_payload::<ProviderClaims>(&tokens.token).ok();
        let now = Utc::now().timestamp();
        *lock(&self.time_skew) = claims
            .as_ref()
            .and_then(|c| c.iat)
            .map(|iat| now.saturating_sub(iat))
            .unwrap_or(0);

        self.persist_tokens(&tokens);
        self.schedule_expiry(claims.as_ref());

        self.state.send_modify(|s| {
            s.state = SessionState::Authenticated;
            s.authenticated = true;
            s.token = Some(tokens.token);
            s.refresh_token = tokens.refresh_token;
            s.id_token = tokens.id_token;
        });
    }

    /// Forget the session locally and in storage, returning what was held
    fn drop_session(&self) -> Option<TokenSet> {
        if let Some(timer) = lock(&self.expiry_timer).take() {
            timer.abort();
        }
        self.clear_stored_tokens();

        let mut previous = None;
        self.state.send_modify(|s| {
            previous = s.token.take().map(|token| TokenSet {
                token,
                refresh_token: s.refresh_token.take(),
                id_token: s.id_token.take(),
            });
            s.state = SessionState::Unauthenticated;
            s.authenticated = false;
        });
        previous
    }

    /// Seconds until the held access token expires, corrected for clock skew
    fn expires_in(&self, claims: &ProviderClaims) -> Option<i64> {
        let exp = claims.exp?;
        Some(
            exp.saturating_sub(Utc::now().timestamp())
                .saturating_add(*lock(&self.time_skew)),
        )
    }

    /// Raise `TokenExpired` when the access token runs out
    fn schedule_expiry(&self, claims: Option<&ProviderClaims>) {
        if let Some(timer) = lock(&self.expiry_timer).take() {
            timer.abort();
        }
        let Some(expires_in) = claims.and_then(|c| self.expires_in(c)) else {
            return;
        };

        let events = self.events.clone();
        if expires_in <= 0 {
            let _ = events.send(IdentityEvent::TokenExpired);
            return;
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(expires_in as u64)).await;
            debug!("Identity token reached its expiry");
            let _ = events.send(IdentityEvent::TokenExpired);
        });
        *lock(&self.expiry_timer) = Some(handle.abort_handle());
    }

    /// Refresh when the access token expires within `min_validity` seconds;
    /// a negative value always refreshes.
    ///
    /// Returns whether a new token was obtained. A failed exchange, or a due
    /// refresh with no refresh token to exchange, ends the session: tokens are
    /// cleared and the provider logout is issued before the lock is released,
    /// so waiters see the session already gone.
    async fn update_token(&self, min_validity: i64) -> Result<bool, IdentityError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.snapshot();
        let Some(token) = current.token.filter(|_| current.authenticated) else {
            return Err(IdentityError::NotAuthenticated);
        };

        if min_validity >= 0 {
            let expires_in = decode_payload::<ProviderClaims>(&token)
                .ok()
                .and_then(|c| self.expires_in(&c));
            if let Some(expires_in) = expires_in {
                if expires_in >= min_validity {
                    debug!(expires_in, min_validity, "Identity token still valid");
                    return Ok(false);
                }
            }
        }

        let Some(refresh_token) = current.refresh_token else {
            let err = IdentityError::MissingRefreshToken;
            warn!(error = %err, "Identity token refresh failed, logging out");
            self.end_session().await;
            return Err(err);
        };

        self.state.send_modify(|s| s.state = SessionState::Refreshing);

        match self.provider.refresh(&refresh_token).await {
            Ok(fresh) => {
                let merged = TokenSet {
                    token: fresh.token,
                    refresh_token: fresh.refresh_token.or(Some(refresh_token)),
                    id_token: fresh.id_token.or(current.id_token),
                };
                self.accept_tokens(merged);
                info!("Identity token refreshed");
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "Identity token refresh failed, logging out");
                self.end_session().await;
                Err(e)
            }
        }
    }

    /// Clear the session and end it at the provider. Callers hold `refresh_lock`.
    async fn end_session(&self) {
        let previous = self.drop_session();
        if let Err(e) = self.provider.logout(previous.as_ref()).await {
            warn!(error = %e, "Provider logout after refresh failure failed");
        }
    }

    async fn handle_event(&self, event: IdentityEvent) {
        match event {
            IdentityEvent::TokenExpired => {
                info!("Identity token expired, attempting refresh");
                match self.update_token(EXPIRED_MIN_VALIDITY_SECS).await {
                    Ok(_) => {}
                    Err(IdentityError::NotAuthenticated) => {
                        debug!("Token expired without a session; ignoring")
                    }
                    Err(_) => {} // already torn down by update_token
                }
            }
            IdentityEvent::AuthLogout => {
                let _guard = self.refresh_lock.lock().await;
                info!("Identity session logged out");
                self.drop_session();
            }
        }
    }
}

async fn refresh_loop(inner: Arc<Inner>) {
    let mut ticker = interval_at(Instant::now() + REFRESH_INTERVAL, REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !inner.snapshot().authenticated {
            debug!("Identity session ended; stopping refresh loop");
            break;
        }
        match inner.update_token(POLL_MIN_VALIDITY_SECS).await {
            Ok(true) => debug!("Refresh loop renewed the identity token"),
            Ok(false) => {}
            Err(_) => break,
        }
    }
}

async fn event_pump(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<IdentityEvent>) {
    while let Some(event) = rx.recv().await {
        inner.handle_event(event).await;
    }
}

/// The identity-provider half of the session manager.
///
/// Background work (refresh loop, expiry timer, event handling) is owned by
/// this value and stops when it is dropped or [`shutdown`](Self::shutdown).
pub struct IdentitySession {
    inner: Arc<Inner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<IdentityEvent>>>,
    event_pump: Mutex<Option<AbortHandle>>,
    refresh_loop: Mutex<Option<AbortHandle>>,
}

impl IdentitySession {
    /// `init_options` carries the handshake settings; stored tokens are added
    /// as seeds when [`init`](Self::init) runs.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn TokenStore>,
        init_options: InitOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(IdentitySnapshot::default());
        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                init_options,
                state,
                time_skew: Mutex::new(0),
                refresh_lock: tokio::sync::Mutex::new(()),
                events: tx,
                expiry_timer: Mutex::new(None),
            }),
            events_rx: Mutex::new(Some(rx)),
            event_pump: Mutex::new(None),
            refresh_loop: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        self.inner.snapshot()
    }

    /// Watch for state changes instead of polling [`snapshot`](Self::snapshot)
    pub fn subscribe(&self) -> watch::Receiver<IdentitySnapshot> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> IdentityEvents {
        IdentityEvents {
            tx: self.inner.events.clone(),
        }
    }

    /// The access token to present as a bearer credential
    pub fn bearer_token(&self) -> Option<String> {
        self.inner.state.borrow().token.clone()
    }

    /// Operator details from the current access token
    pub fn user(&self) -> Option<ProviderUser> {
        let token = self.bearer_token()?;
        decode_payload::<ProviderClaims>(&token)
            .ok()
            .map(|c| c.user())
    }

    /// Run the provider handshake, seeded with any stored tokens.
    ///
    /// Never fails: a provider error is logged and leaves the session
    /// unauthenticated with stored tokens cleared. `loading` turns false only
    /// once the attempt has resolved either way.
    pub async fn init(&self) {
        if self.snapshot().state != SessionState::Uninitialized {
            warn!("Identity session already initialized");
            return;
        }
        self.start_event_pump();

        let options = self.inner.init_options.clone().with_seeds(
            self.inner.read_seed(keys::KC_TOKEN),
            self.inner.read_seed(keys::KC_REFRESH_TOKEN),
            self.inner.read_seed(keys::KC_ID_TOKEN),
        );
        debug!(?options, "Initializing identity session");
        self.inner.state.send_modify(|s| {
            s.state = SessionState::Initializing;
            s.loading = true;
        });

        match self.inner.provider.init(&options).await {
            Ok(Some(tokens)) => {
                self.inner.accept_tokens(tokens);
                self.start_refresh_loop();
                info!("Identity session authenticated");
            }
            Ok(None) => {
                info!("No identity session");
                self.inner.drop_session();
            }
            Err(e) => {
                error!(error = %e, "Identity provider initialization failed");
                self.inner.drop_session();
            }
        }

        self.inner.state.send_modify(|s| s.loading = false);
    }

    /// Refresh if the token expires within `min_validity` seconds.
    /// On failure the session is ended and the provider logout issued.
    pub async fn update_token(&self, min_validity: i64) -> Result<bool, IdentityError> {
        self.inner.update_token(min_validity).await
    }

    /// Process one event right away instead of through the event queue
    pub async fn handle_event(&self, event: IdentityEvent) {
        self.inner.handle_event(event).await;
    }

    /// Start an interactive authorization-code login with PKCE
    pub fn begin_login(&self, redirect_uri: &str) -> Result<PendingLogin, IdentityError> {
        let pkce = PkceChallenge::generate();
        let state = generate_state();
        let url = self
            .inner
            .provider
            .authorization_url(&pkce, &state, redirect_uri)?;
        Ok(PendingLogin {
            url,
            redirect_uri: redirect_uri.to_string(),
            state,
            verifier: pkce.verifier,
        })
    }

    /// Redeem the code from the provider redirect and start the session
    pub async fn complete_login(
        &self,
        pending: &PendingLogin,
        code: &str,
        state: &str,
    ) -> Result<(), IdentityError> {
        if state != pending.state {
            return Err(IdentityError::InvalidResponse(
                "Login state does not match the pending request".to_string(),
            ));
        }

        let tokens = self
            .inner
            .provider
            .exchange_code(code, &pending.verifier, &pending.redirect_uri)
            .await?;

        {
            let _guard = self.inner.refresh_lock.lock().await;
            self.inner.accept_tokens(tokens);
        }
        self.inner.state.send_modify(|s| s.loading = false);
        self.start_event_pump();
        self.start_refresh_loop();
        info!("Interactive login completed");
        Ok(())
    }

    /// End the provider session. Stored tokens are cleared before the
    /// provider is contacted; a provider error is logged and ignored.
    pub async fn logout(&self) {
        self.stop_refresh_loop();
        let previous = {
            let _guard = self.inner.refresh_lock.lock().await;
            self.inner.drop_session()
        };
        if let Err(e) = self.inner.provider.logout(previous.as_ref()).await {
            warn!(error = %e, "Provider logout failed");
        }
    }

    /// End the provider session, then start a fresh interactive login
    pub async fn logout_and_begin_login(
        &self,
        redirect_uri: &str,
    ) -> Result<PendingLogin, IdentityError> {
        self.logout().await;
        self.begin_login(redirect_uri)
    }

    /// Stop all background work. The session state is left as is.
    pub fn shutdown(&self) {
        self.stop_refresh_loop();
        if let Some(pump) = lock(&self.event_pump).take() {
            pump.abort();
        }
        if let Some(timer) = lock(&self.inner.expiry_timer).take() {
            timer.abort();
        }
    }

    fn start_event_pump(&self) {
        let Some(rx) = lock(&self.events_rx).take() else {
            return;
        };
        let handle = tokio::spawn(event_pump(self.inner.clone(), rx));
        *lock(&self.event_pump) = Some(handle.abort_handle());
    }

    fn start_refresh_loop(&self) {
        let handle = tokio::spawn(refresh_loop(self.inner.clone()));
        if let Some(old) = lock(&self.refresh_loop).replace(handle.abort_handle()) {
            old.abort();
        }
    }

    fn stop_refresh_loop(&self) {
        if let Some(handle) = lock(&self.refresh_loop).take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn refresh_loop_running(&self) -> bool {
        lock(&self.refresh_loop)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for IdentitySession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BearerSource for IdentitySession {
    fn bearer_token(&self) -> Option<String> {
        IdentitySession::bearer_token(self)
    }

    fn unauthorized(&self) {
        self.events().send(IdentityEvent::TokenExpired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::test_tokens::{make_token, now};
    use crate::auth::provider::testing::{rejected, tokens, ScriptedProvider};
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn jwt(expires_in: i64) -> String {
        make_token(&json!({"exp": now() + expires_in, "sub": "op-1", "preferred_username": "ops"}))
    }

    fn options() -> InitOptions {
        InitOptions::check_sso("http://localhost:5173/silent-check-sso.html")
    }

    fn session(
        provider: ScriptedProvider,
        store: MemoryStore,
    ) -> (Arc<ScriptedProvider>, Arc<MemoryStore>, IdentitySession) {
        let provider = Arc::new(provider);
        let store = Arc::new(store);
        let session = IdentitySession::new(provider.clone(), store.clone(), options());
        (provider, store, session)
    }

    fn stored(store: &MemoryStore) -> [Option<String>; 3] {
        keys::IDENTITY_KEYS.map(|k| store.get(k).unwrap())
    }

    #[tokio::test]
    async fn test_init_success_persists_and_starts_loop() {
        let access = jwt(3600);
        let provider = ScriptedProvider::new().on_init(Ok(Some(tokens(&access, "r1", "i1"))));
        let (_, store, session) = session(provider, MemoryStore::new());

        assert!(session.snapshot().loading);
        session.init().await;

        let snap = session.snapshot();
        assert!(!snap.loading);
        assert!(snap.authenticated);
        assert_eq!(snap.state, SessionState::Authenticated);
        assert_eq!(
            stored(&store),
            [Some(access.clone()), Some("r1".to_string()), Some("i1".to_string())]
        );
        assert_eq!(session.bearer_token(), Some(access));
        assert!(session.refresh_loop_running());
    }

    #[tokio::test]
    async fn test_init_passes_stored_tokens_as_seeds() {
        let store = MemoryStore::with_entries([
            (keys::KC_TOKEN, "seed-a"),
            (keys::KC_REFRESH_TOKEN, "seed-r"),
            (keys::KC_ID_TOKEN, "seed-i"),
        ]);
        let (provider, _, session) = session(ScriptedProvider::new(), store);
        session.init().await;

        let seen = provider.seen_options.lock().unwrap().clone().unwrap();
        assert_eq!(seen.token.as_deref(), Some("seed-a"));
        assert_eq!(seen.refresh_token.as_deref(), Some("seed-r"));
        assert_eq!(seen.id_token.as_deref(), Some("seed-i"));
        assert!(!seen.check_login_iframe);
        assert_eq!(seen.pkce_method.as_str(), "S256");
    }

    #[tokio::test]
    async fn test_init_failure_clears_tokens() {
        let store = MemoryStore::with_entries([
            (keys::KC_TOKEN, "a"),
            (keys::KC_REFRESH_TOKEN, "r"),
            (keys::KC_ID_TOKEN, "i"),
        ]);
        let provider = ScriptedProvider::new().on_init(Err(IdentityError::InvalidResponse(
            "realm not found".to_string(),
        )));
        let (provider, store, session) = session(provider, store);

        session.init().await;

        let snap = session.snapshot();
        assert!(!snap.authenticated);
        assert!(!snap.loading);
        assert_eq!(snap.state, SessionState::Unauthenticated);
        assert_eq!(stored(&store), [None, None, None]);
        assert_eq!(provider.logouts(), 0);
        assert!(!session.refresh_loop_running());
    }

    #[tokio::test]
    async fn test_init_runs_once() {
        let (provider, _, session) = session(ScriptedProvider::new(), MemoryStore::new());
        session.init().await;
        session.init().await;
        assert_eq!(provider.init_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_token_skips_fresh_token() {
        let provider = ScriptedProvider::new().on_init(Ok(Some(tokens(&jwt(3600), "r1", "i1"))));
        let (provider, _, session) = session(provider, MemoryStore::new());
        session.init().await;

        assert!(!session.update_token(POLL_MIN_VALIDITY_SECS).await.unwrap());
        assert_eq!(provider.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_refresh_replaces_all_three_tokens() {
        let fresh = jwt(3600);
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(10), "r1", "i1"))))
            .then_refresh(Ok(tokens(&fresh, "r2", "i2")));
        let (provider, store, session) = session(provider, MemoryStore::new());
        session.init().await;

        assert!(session.update_token(POLL_MIN_VALIDITY_SECS).await.unwrap());
        assert_eq!(provider.refreshes(), 1);
        assert_eq!(
            stored(&store),
            [Some(fresh.clone()), Some("r2".to_string()), Some("i2".to_string())]
        );
        let snap = session.snapshot();
        assert_eq!(snap.token, Some(fresh));
        assert_eq!(snap.state, SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_refresh_keeps_tokens_the_provider_did_not_reissue() {
        let fresh = jwt(3600);
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(10), "r1", "i1"))))
            .then_refresh(Ok(TokenSet {
                token: fresh.clone(),
                refresh_token: None,
                id_token: None,
            }));
        let (_, store, session) = session(provider, MemoryStore::new());
        session.init().await;

        assert!(session.update_token(-1).await.unwrap());
        assert_eq!(
            stored(&store),
            [Some(fresh), Some("r1".to_string()), Some("i1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_and_logs_out_once() {
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(10), "r1", "i1"))))
            .then_refresh(Err(rejected()));
        let (provider, store, session) = session(provider, MemoryStore::new());
        session.init().await;

        assert!(session.update_token(POLL_MIN_VALIDITY_SECS).await.is_err());
        assert_eq!(stored(&store), [None, None, None]);
        assert_eq!(provider.logouts(), 1);

        let snap = session.snapshot();
        assert!(!snap.authenticated);
        assert_eq!(snap.state, SessionState::Unauthenticated);
        assert_eq!(session.bearer_token(), None);

        // Further triggers find no session and do not log out again
        session.handle_event(IdentityEvent::TokenExpired).await;
        assert!(matches!(
            session.update_token(-1).await,
            Err(IdentityError::NotAuthenticated)
        ));
        assert_eq!(provider.logouts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_share_one_refresh() {
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(10), "r1", "i1"))))
            .then_refresh(Ok(tokens(&jwt(3600), "r2", "i2")));
        let (provider, _, session) = session(provider, MemoryStore::new());
        session.init().await;

        let (a, b) = tokio::join!(
            session.update_token(POLL_MIN_VALIDITY_SECS),
            session.handle_event(IdentityEvent::TokenExpired),
        );
        assert!(a.unwrap());
        let _ = b;
        assert_eq!(provider.refreshes(), 1);
        assert!(session.snapshot().authenticated);
    }

    #[tokio::test]
    async fn test_concurrent_failures_log_out_once() {
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(10), "r1", "i1"))))
            .then_refresh(Err(rejected()));
        let (provider, _, session) = session(provider, MemoryStore::new());
        session.init().await;

        let _ = tokio::join!(
            session.update_token(POLL_MIN_VALIDITY_SECS),
            session.handle_event(IdentityEvent::TokenExpired),
        );
        assert_eq!(provider.refreshes(), 1);
        assert_eq!(provider.logouts(), 1);
    }

    #[tokio::test]
    async fn test_auth_logout_event_clears_without_provider_logout() {
        let provider = ScriptedProvider::new().on_init(Ok(Some(tokens(&jwt(3600), "r1", "i1"))));
        let (provider, store, session) = session(provider, MemoryStore::new());
        session.init().await;

        session.handle_event(IdentityEvent::AuthLogout).await;

        assert!(!session.snapshot().authenticated);
        assert_eq!(stored(&store), [None, None, None]);
        assert_eq!(provider.logouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_renews_near_expiry() {
        let fresh = jwt(3600);
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(45), "r1", "i1"))))
            .then_refresh(Ok(tokens(&fresh, "r2", "i2")));
        let (provider, store, session) = session(provider, MemoryStore::new());
        session.init().await;

        // First tick lands at 30s, inside the 60s validity window
        tokio::time::sleep(REFRESH_INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(provider.refreshes(), 1);
        assert_eq!(store.get(keys::KC_TOKEN).unwrap(), Some(fresh));
        assert!(session.snapshot().authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_failure_stops_loop() {
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(45), "r1", "i1"))))
            .then_refresh(Err(rejected()));
        let (provider, store, session) = session(provider, MemoryStore::new());
        session.init().await;

        tokio::time::sleep(REFRESH_INTERVAL * 4).await;

        assert_eq!(provider.refreshes(), 1);
        assert_eq!(provider.logouts(), 1);
        assert_eq!(stored(&store), [None, None, None]);
        assert!(!session.refresh_loop_running());
    }

    #[tokio::test]
    async fn test_due_refresh_without_refresh_token_ends_session() {
        let provider = ScriptedProvider::new().on_init(Ok(Some(TokenSet {
            token: jwt(10),
            refresh_token: None,
            id_token: Some("i1".to_string()),
        })));
        let (provider, store, session) = session(provider, MemoryStore::new());
        session.init().await;
        assert!(session.snapshot().authenticated);

        assert!(matches!(
            session.update_token(POLL_MIN_VALIDITY_SECS).await,
            Err(IdentityError::MissingRefreshToken)
        ));

        let snap = session.snapshot();
        assert!(!snap.authenticated);
        assert_eq!(snap.state, SessionState::Unauthenticated);
        assert_eq!(stored(&store), [None, None, None]);
        assert_eq!(provider.refreshes(), 0);
        assert_eq!(provider.logouts(), 1);

        session.handle_event(IdentityEvent::TokenExpired).await;
        assert_eq!(provider.logouts(), 1);
    }

    #[tokio::test]
    async fn test_token_expired_event_without_refresh_token_ends_session() {
        let provider = ScriptedProvider::new().on_init(Ok(Some(TokenSet {
            token: jwt(10),
            refresh_token: None,
            id_token: None,
        })));
        let (provider, store, session) = session(provider, MemoryStore::new());
        session.init().await;

        session.handle_event(IdentityEvent::TokenExpired).await;

        assert!(!session.snapshot().authenticated);
        assert_eq!(stored(&store), [None, None, None]);
        assert_eq!(provider.logouts(), 1);
    }

    #[tokio::test]
    async fn test_fresh_token_without_refresh_token_is_kept() {
        let provider = ScriptedProvider::new().on_init(Ok(Some(TokenSet {
            token: jwt(3600),
            refresh_token: None,
            id_token: None,
        })));
        let (provider, _, session) = session(provider, MemoryStore::new());
        session.init().await;

        assert!(!session.update_token(POLL_MIN_VALIDITY_SECS).await.unwrap());
        assert!(session.snapshot().authenticated);
        assert_eq!(provider.logouts(), 0);
    }

    #[tokio::test]
    async fn test_extreme_iat_and_exp_do_not_overflow() {
        let access = make_token(&json!({"exp": i64::MAX, "iat": i64::MIN, "sub": "op-1"}));
        let provider = ScriptedProvider::new().on_init(Ok(Some(tokens(&access, "r1", "i1"))));
        let (provider, _, session) = session(provider, MemoryStore::new());
        session.init().await;

        assert!(!session.update_token(POLL_MIN_VALIDITY_SECS).await.unwrap());
        assert_eq!(provider.refreshes(), 0);

        let claims: ProviderClaims =
            serde_json::from_value(json!({"exp": i64::MIN, "iat": i64::MAX})).unwrap();
        let inner = &session.inner;
        *lock(&inner.time_skew) = i64::MIN;
        assert_eq!(inner.expires_in(&claims), Some(i64::MIN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_session_cancels_background_work() {
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(45), "r1", "i1"))))
            .then_refresh(Ok(tokens(&jwt(3600), "r2", "i2")));
        let (provider, _, session) = session(provider, MemoryStore::new());
        let session = Arc::new(session);
        session.init().await;

        drop(session);
        tokio::time::sleep(REFRESH_INTERVAL * 4).await;

        assert_eq!(provider.refreshes(), 0);
        assert_eq!(provider.logouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_background_work() {
        let provider = ScriptedProvider::new().on_init(Ok(Some(tokens(&jwt(45), "r1", "i1"))));
        let (provider, _, session) = session(provider, MemoryStore::new());
        session.init().await;

        session.shutdown();
        tokio::time::sleep(REFRESH_INTERVAL * 4).await;

        assert_eq!(provider.refreshes(), 0);
        assert!(!session.refresh_loop_running());
    }

    #[tokio::test]
    async fn test_unauthorized_signal_triggers_refresh() {
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(10), "r1", "i1"))))
            .then_refresh(Ok(tokens(&jwt(3600), "r2", "i2")));
        let (provider, _, session) = session(provider, MemoryStore::new());
        session.init().await;
        let mut updates = session.subscribe();

        BearerSource::unauthorized(&session);
        while updates.borrow_and_update().refresh_token.as_deref() != Some("r2") {
            updates.changed().await.unwrap();
        }
        assert_eq!(provider.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_interactive_login() {
        let access = jwt(3600);
        let provider = ScriptedProvider::new().then_refresh(Ok(tokens(&access, "r1", "i1")));
        let (_, store, session) = session(provider, MemoryStore::new());
        session.init().await;
        assert!(!session.snapshot().authenticated);

        let pending = session.begin_login("http://localhost:5173/").unwrap();
        assert!(pending.url.contains("code_challenge="));

        let callback = format!("http://localhost:5173/?code=good&state={}", pending.state);
        let (code, state) = PendingLogin::parse_callback(&callback).unwrap();

        // A forged state is refused before any exchange
        assert!(session.complete_login(&pending, &code, "forged").await.is_err());

        session.complete_login(&pending, &code, &state).await.unwrap();
        assert!(session.snapshot().authenticated);
        assert_eq!(store.get(keys::KC_TOKEN).unwrap(), Some(access));
        assert_eq!(session.user().unwrap().username.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn test_logout_and_begin_login() {
        let provider = ScriptedProvider::new()
            .on_init(Ok(Some(tokens(&jwt(3600), "r1", "i1"))))
            .then_refresh(Ok(tokens(&jwt(3600), "r2", "i2")));
        let (provider, store, session) = session(provider, MemoryStore::new());
        session.init().await;

        let pending = session
            .logout_and_begin_login("http://localhost:5173/")
            .await
            .unwrap();

        assert_eq!(provider.logouts(), 1);
        assert_eq!(stored(&store), [None, None, None]);
        assert!(!session.snapshot().authenticated);
        assert!(pending.url.contains("code_challenge="));

        let callback = format!("http://localhost:5173/?code=good&state={}", pending.state);
        let (code, state) = PendingLogin::parse_callback(&callback).unwrap();
        session.complete_login(&pending, &code, &state).await.unwrap();
        assert_eq!(stored(&store)[1].as_deref(), Some("r2"));
    }

    #[test]
    fn test_parse_callback_errors() {
        assert!(PendingLogin::parse_callback("not a url").is_err());
        assert!(PendingLogin::parse_callback("http://localhost/?state=x").is_err());
        assert!(matches!(
            PendingLogin::parse_callback("http://localhost/?error=access_denied&state=x"),
            Err(IdentityError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_explicit_logout_clears_then_calls_provider() {
        let provider = ScriptedProvider::new().on_init(Ok(Some(tokens(&jwt(3600), "r1", "i1"))));
        let (provider, store, session) = session(provider, MemoryStore::new());
        session.init().await;

        session.logout().await;

        assert_eq!(stored(&store), [None, None, None]);
        assert_eq!(provider.logouts(), 1);
        assert!(!session.refresh_loop_running());
        assert_eq!(session.snapshot().state, SessionState::Unauthenticated);
    }
}
