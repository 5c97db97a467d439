//! Token lifecycle orchestration.
//!
//! [`OAuthTokenManager`] owns the pull-based refresh model: nothing refreshes
//! tokens in the background, callers ask for an access token and the manager
//! refreshes on demand when the stored one is inside the expiry skew window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::TokenError;
use crate::google::{GoogleOAuthClient, classify_refresh_error, scope_string};
use crate::models::token_record::{ConnectionState, ConnectionStatus, TokenRecord};
use crate::store::{TokenStore, shared_store, token_key};

/// Manages Google OAuth tokens for all users against a shared token store.
pub struct OAuthTokenManager {
    config: Arc<AppConfig>,
    store: Arc<dyn TokenStore>,
    google: Option<GoogleOAuthClient>,
    /// One lock per user serializing the check-then-refresh sequence, so
    /// concurrent callers with an expired token produce a single provider
    /// call. Entries are never evicted; the map is bounded by the number of
    /// distinct users seen by this process.
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OAuthTokenManager {
    /// Creates a manager over an explicit store. The provider client is only
    /// built when credentials are configured, so store-only paths (status,
    /// disconnect) work without them.
    pub fn new(config: Arc<AppConfig>, store: Arc<dyn TokenStore>) -> Self {
        let google = GoogleOAuthClient::from_config(&config).ok();
        Self {
            config,
            store,
            google,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a manager over the process-wide store installed via
    /// [`crate::store::init_shared_store`].
    pub fn from_shared_store(config: Arc<AppConfig>) -> Result<Self, TokenError> {
        let store = shared_store()?;
        Ok(Self::new(config, store))
    }

    fn provider(&self) -> Result<&GoogleOAuthClient, TokenError> {
        self.google.as_ref().ok_or_else(|| {
            TokenError::Configuration(
                "Google OAuth credentials are not configured".to_string(),
            )
        })
    }

    /// Builds the Google consent URL for a user. The user id rides along in
    /// `state` so the callback can tie tokens back to the right account.
    pub fn build_authorization_url(&self, user_id: &str) -> Result<String, TokenError> {
        if user_id.is_empty() {
            return Err(TokenError::InvalidUserId);
        }
        let client_id = self
            .config
            .google_client_id
            .as_deref()
            .ok_or_else(|| TokenError::Configuration("GOOGLE_CLIENT_ID is not set".to_string()))?;

        let mut url = Url::parse(&self.config.google_auth_url)
            .map_err(|err| TokenError::Configuration(format!("bad authorization URL: {err}")))?;

        // offline + consent force Google to return a refresh token even when
        // the user already granted access once.
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", &self.config.google_redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scope_string())
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", user_id);

        Ok(url.into())
    }

    /// Returns a usable access token for the user, refreshing first when the
    /// stored one is within sixty seconds of expiry.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_access_token(&self, user_id: &str) -> Result<String, TokenError> {
        if user_id.is_empty() {
            return Err(TokenError::InvalidUserId);
        }

        let record = self
            .load_record(user_id)
            .await?
            .ok_or_else(|| TokenError::not_connected(user_id))?;

        if !record.is_expired(now_ms()) {
            return Ok(record.access_token);
        }

        // Serialize per user so only the first caller past this point hits
        // the provider.
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let record = self
            .load_record(user_id)
            .await?
            .ok_or_else(|| TokenError::not_connected(user_id))?;
        if !record.is_expired(now_ms()) {
            debug!("token refreshed by concurrent caller, reusing");
            return Ok(record.access_token);
        }

        let updated = self.do_refresh(&record).await?;
        Ok(updated.access_token)
    }

    /// Forces a refresh of the user's access token regardless of its expiry.
    pub async fn refresh_access_token(&self, user_id: &str) -> Result<TokenRecord, TokenError> {
        if user_id.is_empty() {
            return Err(TokenError::InvalidUserId);
        }
        let record = self
            .load_record(user_id)
            .await?
            .ok_or_else(|| TokenError::not_connected(user_id))?;

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        self.do_refresh(&record).await
    }

    /// Reports whether the user has a Google connection.
    ///
    /// Connected means a record with an access token exists. Expiry is
    /// deliberately not consulted: a connection that needs a refresh, or
    /// whose refresh will fail, still reports connected until the user
    /// re-authorizes or disconnects.
    pub async fn get_connection_status(
        &self,
        user_id: &str,
    ) -> Result<ConnectionStatus, TokenError> {
        if user_id.is_empty() {
            return Err(TokenError::InvalidUserId);
        }
        match self.load_record(user_id).await? {
            Some(record) => Ok(ConnectionStatus::from_record(&record)),
            None => Ok(ConnectionStatus::disconnected()),
        }
    }

    /// Derives the full lifecycle state, including expiry, for callers that
    /// need more than the connected flag.
    pub async fn connection_state(&self, user_id: &str) -> Result<ConnectionState, TokenError> {
        if user_id.is_empty() {
            return Err(TokenError::InvalidUserId);
        }
        let record = self.load_record(user_id).await?;
        Ok(ConnectionState::of(record.as_ref(), now_ms()))
    }

    /// Completes the OAuth callback leg: exchanges the authorization code,
    /// fetches the account email and persists the token record.
    #[instrument(skip(self, code), fields(user_id = %user_id))]
    pub async fn complete_authorization(
        &self,
        user_id: &str,
        code: &str,
    ) -> Result<ConnectionStatus, TokenError> {
        if user_id.is_empty() {
            return Err(TokenError::InvalidUserId);
        }

        let provider = self.provider()?;
        let response = provider
            .exchange_code(code, &self.config.google_redirect_uri)
            .await?;

        // Email is display-only; a userinfo hiccup must not fail the connect.
        let provider_email = match provider.fetch_user_email(&response.access_token).await {
            Ok(email) => email,
            Err(err) => {
                warn!(error = %err, "could not fetch account email, continuing without it");
                None
            }
        };

        let record = TokenRecord {
            user_id: user_id.to_string(),
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at_ms: expires_at_from(response.expires_in),
            scope: response.scope.unwrap_or_else(scope_string),
            connected_at: Utc::now(),
            provider_email,
        };

        self.store
            .hash_set(&token_key(user_id), record.to_hash())
            .await
            .map_err(TokenError::Store)?;

        counter!("google_connections_total").increment(1);
        info!(has_refresh_token = record.refresh_token.is_some(), "Google account connected");

        Ok(ConnectionStatus::from_record(&record))
    }

    /// Removes the user's token record.
    pub async fn disconnect(&self, user_id: &str) -> Result<(), TokenError> {
        if user_id.is_empty() {
            return Err(TokenError::InvalidUserId);
        }
        self.store
            .delete(&token_key(user_id))
            .await
            .map_err(TokenError::Store)?;
        info!(user_id, "Google account disconnected");
        Ok(())
    }

    async fn load_record(&self, user_id: &str) -> Result<Option<TokenRecord>, TokenError> {
        let fields = self
            .store
            .hash_get_all(&token_key(user_id))
            .await
            .map_err(TokenError::Store)?;
        Ok(TokenRecord::from_hash(user_id, &fields))
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks.entry(user_id.to_string()).or_default().clone()
    }

    /// Refreshes `record` against the provider and persists the result.
    /// On failure the stored record is left untouched so the user keeps
    /// reporting connected and a later attempt can still succeed.
    async fn do_refresh(&self, record: &TokenRecord) -> Result<TokenRecord, TokenError> {
        let Some(refresh_token) = record.refresh_token.as_deref().filter(|t| !t.is_empty())
        else {
            counter!("google_token_refresh_failure_total").increment(1);
            return Err(TokenError::refresh_failed(
                "no refresh token stored; user must re-authorize",
            ));
        };

        match self.provider()?.refresh_access_token(refresh_token).await {
            Ok(response) => {
                let mut updated = record.clone();
                updated.access_token = response.access_token;
                updated.expires_at_ms = expires_at_from(response.expires_in);
                // Google only sends a refresh token here when it rotates one.
                if let Some(new_refresh) = response.refresh_token {
                    updated.refresh_token = Some(new_refresh);
                }

                self.store
                    .hash_set(&token_key(&record.user_id), updated.to_hash())
                    .await
                    .map_err(TokenError::Store)?;

                counter!("google_token_refresh_success_total").increment(1);
                info!(
                    user_id = %record.user_id,
                    expires_at_ms = updated.expires_at_ms,
                    "access token refreshed"
                );
                Ok(updated)
            }
            Err(err) => {
                counter!("google_token_refresh_failure_total").increment(1);
                if let TokenError::RefreshFailed { reason } = &err {
                    warn!(
                        user_id = %record.user_id,
                        classification = ?classify_refresh_error(reason),
                        error = %err,
                        "token refresh failed, stored record left untouched"
                    );
                } else {
                    warn!(
                        user_id = %record.user_id,
                        error = %err,
                        "token refresh failed, stored record left untouched"
                    );
                }
                Err(err)
            }
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expires_at_from(expires_in: Option<u64>) -> i64 {
    // Google omits expires_in only in odd edge cases; assume the usual hour.
    let lifetime_s = expires_in.unwrap_or(3600);
    now_ms() + (lifetime_s as i64) * 1000
}
