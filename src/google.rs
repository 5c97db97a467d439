//! HTTP client for Google's OAuth 2.0 endpoints.
//!
//! Covers the three provider calls the lifecycle needs: refreshing an access
//! token, exchanging an authorization code, and fetching the account email.
//! Transient network failures are retried with jittered exponential backoff;
//! a definitive provider response (any HTTP status) is never retried.

use std::time::Duration;

use metrics::counter;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::config::AppConfig;
use crate::error::TokenError;

/// Scopes requested at authorization time. A superset of what any single
/// feature needs, so one consent covers mail and calendar.
pub const DEFAULT_SCOPES: [&str; 6] = [
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/calendar.readonly",
    "https://www.googleapis.com/auth/calendar.events",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

/// Space-separated scope string for the authorization URL.
pub fn scope_string() -> String {
    DEFAULT_SCOPES.join(" ")
}

/// Token endpoint response for both the refresh and code-exchange grants.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleTokenResponse {
    pub access_token: String,
    /// Lifetime in seconds. Google always sends it, but the field is
    /// optional in the RFC so a missing value falls back at the call site.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Only present on code exchange, and on refresh when Google rotates
    /// the refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(default)]
    email: Option<String>,
}

/// Whether a failed refresh can be expected to succeed on a later attempt
/// without user involvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshErrorClass {
    /// The grant itself is dead (revoked, expired, wrong client). Only a new
    /// authorization fixes it.
    Permanent,
    /// Provider-side or network trouble; the stored grant may still be good.
    Transient,
}

/// Classifies a token-endpoint error body.
pub fn classify_refresh_error(body: &str) -> RefreshErrorClass {
    const PERMANENT_MARKERS: [&str; 6] = [
        "invalid_grant",
        "invalid_client",
        "unauthorized_client",
        "unsupported_grant_type",
        "access_denied",
        "revoked",
    ];

    let lowered = body.to_ascii_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        RefreshErrorClass::Permanent
    } else {
        RefreshErrorClass::Transient
    }
}

enum TokenGrant<'a> {
    Refresh { refresh_token: &'a str },
    AuthorizationCode { code: &'a str, redirect_uri: &'a str },
}

impl TokenGrant<'_> {
    fn name(&self) -> &'static str {
        match self {
            TokenGrant::Refresh { .. } => "refresh_token",
            TokenGrant::AuthorizationCode { .. } => "authorization_code",
        }
    }

    fn failure(&self, reason: String) -> TokenError {
        match self {
            TokenGrant::Refresh { .. } => TokenError::refresh_failed(reason),
            TokenGrant::AuthorizationCode { .. } => TokenError::exchange_failed(reason),
        }
    }
}

/// Client for Google's token and userinfo endpoints.
#[derive(Debug, Clone)]
pub struct GoogleOAuthClient {
    client_id: String,
    client_secret: String,
    token_url: String,
    userinfo_url: String,
    max_retries: u32,
    retry_base_ms: u64,
    http: reqwest::Client,
}

impl GoogleOAuthClient {
    /// Builds a client from configuration. Fails when either credential is
    /// missing.
    pub fn from_config(config: &AppConfig) -> Result<Self, TokenError> {
        let client_id = config
            .google_client_id
            .clone()
            .ok_or_else(|| TokenError::Configuration("GOOGLE_CLIENT_ID is not set".to_string()))?;
        let client_secret = config.google_client_secret.clone().ok_or_else(|| {
            TokenError::Configuration("GOOGLE_CLIENT_SECRET is not set".to_string())
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.token_refresh.http_timeout_seconds))
            .build()
            .map_err(|err| {
                TokenError::Configuration(format!("failed to build HTTP client: {err}"))
            })?;

        Ok(Self {
            client_id,
            client_secret,
            token_url: config.google_token_url.clone(),
            userinfo_url: config.google_userinfo_url.clone(),
            max_retries: config.token_refresh.max_retries,
            retry_base_ms: config.token_refresh.retry_base_ms,
            http,
        })
    }

    /// Redeems a refresh token for a new access token.
    #[instrument(skip_all)]
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<GoogleTokenResponse, TokenError> {
        self.post_token_form(TokenGrant::Refresh { refresh_token })
            .await
    }

    /// Exchanges an authorization code for the initial token pair.
    #[instrument(skip_all)]
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<GoogleTokenResponse, TokenError> {
        self.post_token_form(TokenGrant::AuthorizationCode { code, redirect_uri })
            .await
    }

    /// Fetches the account email for a freshly issued access token.
    #[instrument(skip_all)]
    pub async fn fetch_user_email(&self, access_token: &str) -> Result<Option<String>, TokenError> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| TokenError::Transient(err.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::Transient(format!(
                "userinfo request returned status {}",
                response.status()
            )));
        }

        let info: UserInfoResponse = response
            .json()
            .await
            .map_err(|err| TokenError::Transient(format!("bad userinfo response: {err}")))?;

        Ok(info.email)
    }

    async fn post_token_form(
        &self,
        grant: TokenGrant<'_>,
    ) -> Result<GoogleTokenResponse, TokenError> {
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", grant.name()),
        ];
        match &grant {
            TokenGrant::Refresh { refresh_token } => {
                params.push(("refresh_token", refresh_token));
            }
            TokenGrant::AuthorizationCode { code, redirect_uri } => {
                params.push(("code", code));
                params.push(("redirect_uri", redirect_uri));
            }
        }

        let mut attempt: u32 = 0;
        let response = loop {
            match self.http.post(&self.token_url).form(&params).send().await {
                Ok(response) => break response,
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    counter!("google_token_endpoint_retry_total").increment(1);
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        grant = grant.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "token endpoint request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(grant.failure(format!(
                        "network error after {} attempts: {err}",
                        attempt + 1
                    )));
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(grant = grant.name(), status = %status, "token endpoint rejected request");
            return Err(grant.failure(format!("status {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|err| grant.failure(format!("bad token response: {err}")))
    }

    // Exponential backoff with full jitter, capped at 10s.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .retry_base_ms
            .saturating_mul(1u64 << attempt.min(6))
            .min(10_000);
        let jitter = rand::thread_rng().gen_range(0..=self.retry_base_ms);
        Duration::from_millis(exp.saturating_add(jitter).min(10_000))
    }
}
