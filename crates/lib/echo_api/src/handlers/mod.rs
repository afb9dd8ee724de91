//! Request handlers.

pub mod api_keys;
pub mod health;
pub mod oauth;
pub mod proxy;
pub mod resources;
pub mod spend_pools;
pub mod webhooks;
