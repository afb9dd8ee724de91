//! Service layer: integrations the handlers lean on.

pub mod dashboard;
pub mod upstream;
pub mod x402;
