//! Domain models shared by the services and the HTTP layer.

pub mod auth;
pub mod billing;
