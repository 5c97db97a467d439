//! Persisted credential bundle for one user's Google connection.
//!
//! A record exists for a user exactly when that user has completed the OAuth
//! consent flow at least once. The record is mutated in place by token
//! refresh and only removed by an explicit disconnect.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Safety margin subtracted from the token expiry when deciding whether the
/// access token is still usable. Tokens inside this window are refreshed
/// before being handed out.
pub const REFRESH_SKEW_MS: i64 = 60_000;

/// Stored hash field names.
const FIELD_ACCESS_TOKEN: &str = "access_token";
const FIELD_REFRESH_TOKEN: &str = "refresh_token";
const FIELD_EXPIRES_AT: &str = "expires_at";
const FIELD_SCOPE: &str = "scope";
const FIELD_CONNECTED_AT: &str = "connected_at";
const FIELD_PROVIDER_EMAIL: &str = "provider_email";

/// Credential bundle for one `(user, provider)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub user_id: String,
    /// Short-lived bearer credential.
    pub access_token: String,
    /// Long-lived credential issued at authorization time. Retained across
    /// refreshes unless the provider issues a new one. Absent refresh token
    /// plus an expired access token is a terminal state.
    pub refresh_token: Option<String>,
    /// Absolute expiry of `access_token` in epoch milliseconds.
    pub expires_at_ms: i64,
    /// Space-separated grant string as returned by the provider. Immutable
    /// until re-authorization.
    pub scope: String,
    /// Timestamp of the first successful authorization.
    pub connected_at: DateTime<Utc>,
    /// External account email, for display only.
    pub provider_email: Option<String>,
}

impl TokenRecord {
    /// True when `now_ms` has entered the refresh skew window, i.e. the
    /// access token must not be used without refreshing first.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms - REFRESH_SKEW_MS
    }

    /// Granted permission strings.
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn has_gmail(&self) -> bool {
        self.scope.contains("gmail")
    }

    pub fn has_calendar(&self) -> bool {
        self.scope.contains("calendar")
    }

    /// Lifecycle state of this record at `now_ms`.
    pub fn state(&self, now_ms: i64) -> ConnectionState {
        if !self.is_expired(now_ms) {
            ConnectionState::Valid
        } else if self
            .refresh_token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
        {
            ConnectionState::Expired
        } else {
            ConnectionState::Broken
        }
    }

    /// Serializes the record into the store's string-hash shape.
    pub fn to_hash(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert(FIELD_ACCESS_TOKEN.to_string(), self.access_token.clone());
        if let Some(refresh_token) = &self.refresh_token {
            fields.insert(FIELD_REFRESH_TOKEN.to_string(), refresh_token.clone());
        }
        fields.insert(FIELD_EXPIRES_AT.to_string(), self.expires_at_ms.to_string());
        fields.insert(FIELD_SCOPE.to_string(), self.scope.clone());
        fields.insert(
            FIELD_CONNECTED_AT.to_string(),
            self.connected_at.to_rfc3339(),
        );
        if let Some(email) = &self.provider_email {
            fields.insert(FIELD_PROVIDER_EMAIL.to_string(), email.clone());
        }
        fields
    }

    /// Reconstructs a record from the store's string-hash shape.
    ///
    /// Returns `None` for an empty hash or one without a non-empty access
    /// token, matching "a record exists iff the user ever authorized".
    /// An unparseable `expires_at` is treated as 0, i.e. already expired.
    pub fn from_hash(user_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let access_token = fields.get(FIELD_ACCESS_TOKEN)?;
        if access_token.is_empty() {
            return None;
        }

        let expires_at_ms = fields
            .get(FIELD_EXPIRES_AT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let connected_at = fields
            .get(FIELD_CONNECTED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Some(Self {
            user_id: user_id.to_string(),
            access_token: access_token.clone(),
            refresh_token: fields
                .get(FIELD_REFRESH_TOKEN)
                .filter(|t| !t.is_empty())
                .cloned(),
            expires_at_ms,
            scope: fields.get(FIELD_SCOPE).cloned().unwrap_or_default(),
            connected_at,
            provider_email: fields.get(FIELD_PROVIDER_EMAIL).cloned(),
        })
    }
}

/// Lifecycle state of a user's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No record exists; the user never authorized.
    NotConnected,
    /// Access token usable without refresh.
    Valid,
    /// Access token inside the skew window or past expiry, refresh token
    /// available.
    Expired,
    /// Access token expired with no refresh token; only re-authorization
    /// recovers.
    Broken,
}

impl ConnectionState {
    /// Derives the state for an optional record.
    pub fn of(record: Option<&TokenRecord>, now_ms: i64) -> Self {
        match record {
            Some(record) => record.state(now_ms),
            None => ConnectionState::NotConnected,
        }
    }
}

/// Connection status report.
///
/// `connected` reflects whether a record with an access token exists, not
/// whether that token is currently valid: a user whose token expired and
/// whose refresh would fail still reports `connected: true` until a new
/// authorization overwrites the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    pub scopes_granted: Vec<String>,
    pub has_gmail: bool,
    pub has_calendar: bool,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            provider_email: None,
            connected_at: None,
            scopes_granted: Vec::new(),
            has_gmail: false,
            has_calendar: false,
        }
    }

    pub fn from_record(record: &TokenRecord) -> Self {
        Self {
            connected: true,
            provider_email: record.provider_email.clone(),
            connected_at: Some(record.connected_at),
            scopes_granted: record.scopes(),
            has_gmail: record.has_gmail(),
            has_calendar: record.has_calendar(),
        }
    }
}
