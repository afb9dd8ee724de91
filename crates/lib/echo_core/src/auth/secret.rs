//! Signing-secret resolution.
//!
//! Each secret is looked up in a list of env vars, then in a file under the
//! platform data directory, and finally generated and persisted there so a
//! restarted dev server keeps honouring tokens it already issued.

use std::path::PathBuf;

use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use tracing::{info, warn};

/// Length of a generated secret.
const GENERATED_SECRET_LEN: usize = 64;

/// Resolve a secret: first non-empty env var in `env_vars` → persisted `file_name` → generated.
pub fn resolve_secret(env_vars: &[&str], file_name: &str) -> String {
    for var in env_vars {
        if let Ok(secret) = std::env::var(var)
            && !secret.is_empty()
        {
            return secret;
        }
    }

    let secret_path = secret_path(file_name);
    if let Ok(existing) = std::fs::read_to_string(&secret_path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let secret = generate_secret();
    if let Some(parent) = secret_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&secret_path, &secret) {
        warn!(path = %secret_path.display(), error = %e, "could not persist generated secret");
    } else {
        info!(path = %secret_path.display(), "generated new signing secret");
    }
    secret
}

fn generate_secret() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_LEN)
        .map(char::from)
        .collect()
}

fn secret_path(file_name: &str) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("echo")
        .join(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secrets_differ() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), GENERATED_SECRET_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn secret_files_live_under_echo_dir() {
        let path = secret_path("access-token-secret");
        assert!(path.ends_with("echo/access-token-secret") || path.ends_with("echo\\access-token-secret"));
    }
}
