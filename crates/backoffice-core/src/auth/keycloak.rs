//! Keycloak implementation of [`IdentityProvider`] over its OpenID Connect
//! endpoints. The client is public: no client secret is sent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::pkce::PkceChallenge;
use super::provider::{IdentityError, IdentityProvider, InitOptions, TokenSet};
use crate::api::error::truncate_body;
use crate::config::IdentityConfig;

/// Same budget as the backend client
const REQUEST_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
}

impl From<TokenResponse> for TokenSet {
    fn from(r: TokenResponse) -> Self {
        TokenSet {
            token: r.access_token,
            refresh_token: r.refresh_token,
            id_token: r.id_token,
        }
    }
}

pub struct KeycloakClient {
    client: Client,
    config: IdentityConfig,
}

impl KeycloakClient {
    pub fn new(config: IdentityConfig) -> Result<Self, IdentityError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        info!(
            realm = %config.realm,
            client_id = %config.client_id,
            "Creating Keycloak client"
        );
        Ok(Self { client, config })
    }

    fn endpoint(&self, name: &str) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/{}",
            self.config.url.trim_end_matches('/'),
            self.config.realm,
            name
        )
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenSet, IdentityError> {
        let response = self
            .client
            .post(self.endpoint("token"))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Rejected {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::InvalidResponse(e.to_string()))?;
        Ok(tokens.into())
    }
}

#[async_trait]
impl IdentityProvider for KeycloakClient {
    async fn init(&self, options: &InitOptions) -> Result<Option<TokenSet>, IdentityError> {
        if options.check_login_iframe {
            debug!("Login iframe checking needs a browser; ignoring");
        }

        // Stored tokens are only trusted after the provider re-issues them
        if let (true, Some(refresh_token)) = (options.has_seeds(), options.refresh_token.as_deref()) {
            match self.refresh(refresh_token).await {
                Ok(tokens) => return Ok(Some(tokens)),
                Err(IdentityError::Rejected { status, .. }) => {
                    info!(status, "Stored identity session is no longer valid");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            on_load = ?options.on_load,
            redirect = %options.silent_check_sso_redirect_uri,
            "No provider session detected"
        );
        Ok(None)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IdentityError> {
        debug!(realm = %self.config.realm, "Refreshing identity token");
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn logout(&self, tokens: Option<&TokenSet>) -> Result<(), IdentityError> {
        let Some(refresh_token) = tokens.and_then(|t| t.refresh_token.as_deref()) else {
            debug!("No refresh token; nothing to end at the provider");
            return Ok(());
        };

        let mut form = vec![
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if let Some(id_token) = tokens.and_then(|t| t.id_token.as_deref()) {
            form.push(("id_token_hint", id_token));
        }
        if let Some(redirect) = self.config.post_logout_redirect_uri.as_deref() {
            form.push(("post_logout_redirect_uri", redirect));
        }

        let response = self
            .client
            .post(self.endpoint("logout"))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            info!("Provider session ended");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Provider logout was rejected");
            Err(IdentityError::Rejected {
                status: status.as_u16(),
                body: truncate_body(&body),
            })
        }
    }

    fn authorization_url(
        &self,
        pkce: &PkceChallenge,
        state: &str,
        redirect_uri: &str,
    ) -> Result<String, IdentityError> {
        let url = Url::parse_with_params(
            &self.endpoint("auth"),
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("response_mode", "query"),
                ("scope", "openid"),
                ("state", state),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| IdentityError::InvalidResponse(format!("Invalid provider URL: {}", e)))?;
        Ok(url.into())
    }

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, IdentityError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier),
        ])
        .await
    }
}
