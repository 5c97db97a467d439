//! # Error Handling
//!
//! Typed failures for the connection lifecycle. Every error propagates to the
//! caller; nothing is swallowed or silently retried past its bounded budget.
//! The API layer is expected to map [`TokenError::NotConnected`] and
//! [`TokenError::RefreshFailed`] to a "please reconnect your account"
//! response.

use thiserror::Error;

/// Failures surfaced by the token manager and its collaborators.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Required provider credentials are missing or malformed. Fatal and not
    /// retryable; signals server misconfiguration rather than a user problem.
    #[error("Google OAuth is not configured: {0}")]
    Configuration(String),

    /// The caller supplied an empty user id.
    #[error("user id must not be empty")]
    InvalidUserId,

    /// No token record exists for the user. Recoverable by initiating
    /// authorization.
    #[error("Google account is not connected for user '{user_id}'")]
    NotConnected { user_id: String },

    /// The provider rejected the refresh attempt, or transient retries were
    /// exhausted. Recoverable only by full re-authorization.
    #[error("token refresh failed: {reason}")]
    RefreshFailed { reason: String },

    /// The provider rejected the authorization-code exchange.
    #[error("token exchange failed: {reason}")]
    ExchangeFailed { reason: String },

    /// Timeout or connection failure talking to the provider. Retried a
    /// bounded number of times inside the provider client before being
    /// reported as [`TokenError::RefreshFailed`].
    #[error("network error talking to Google: {0}")]
    Transient(String),

    /// The token store failed.
    #[error("token store error: {0:#}")]
    Store(anyhow::Error),
}

impl TokenError {
    pub fn refresh_failed<S: Into<String>>(reason: S) -> Self {
        Self::RefreshFailed {
            reason: reason.into(),
        }
    }

    pub fn exchange_failed<S: Into<String>>(reason: S) -> Self {
        Self::ExchangeFailed {
            reason: reason.into(),
        }
    }

    pub fn not_connected<S: Into<String>>(user_id: S) -> Self {
        Self::NotConnected {
            user_id: user_id.into(),
        }
    }

    /// True when the only way forward is sending the user back through the
    /// consent screen.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. } | Self::RefreshFailed { .. }
        )
    }
}
