//! # echo_core
//!
//! Core domain logic for the Echo billing gateway: OAuth2 + PKCE, token
//! issuance, and the metered ledger.

pub mod auth;
pub mod billing;
pub mod config;
pub mod db;
pub mod migrate;
pub mod models;
pub mod oauth;
pub mod uuid;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
