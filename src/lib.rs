//! # OkAimy Connect
//!
//! Google connection lifecycle for the OkAimy assistant: authorization URL
//! construction, callback code exchange, persisted token records, connection
//! status, and just-in-time access-token refresh.
//!
//! The API-handler layer that exposes these operations over HTTP lives
//! outside this crate, as do the Gmail/Calendar consumers of the tokens.

pub mod config;
pub mod error;
pub mod google;
pub mod manager;
pub mod models;
pub mod store;
pub mod telemetry;

pub use error::TokenError;
pub use manager::OAuthTokenManager;
pub use models::token_record::{ConnectionState, ConnectionStatus, TokenRecord};
