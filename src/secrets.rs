//! Secret loading
//!
//! Secrets (currently the TronGrid API key) are returned as `Zeroizing<String>`
//! so they are wiped when dropped.
//!
//! Lookup order for a secret named `NAME`:
//! 1. the file named by `NAME_FILE` (container secret mounts)
//! 2. the `NAME` environment variable, when allowed

use std::env;
use std::fs;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Error type for secret loading operations
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Failed to read secret file {path}: {reason}")]
    FileError { path: String, reason: String },

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for secret loading
#[derive(Debug, Clone)]
pub struct SecretConfig {
    /// Whether plain environment variables are accepted
    pub allow_env_vars: bool,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            allow_env_vars: true,
        }
    }
}

/// Load a required secret.
pub fn load_secret(name: &str, config: &SecretConfig) -> Result<Zeroizing<String>, SecretError> {
    let file_var = format!("{}_FILE", name);
    if let Ok(path) = env::var(&file_var) {
        let secret = load_from_file(&path)?;
        info!("Loaded secret {} from file", name);
        return Ok(secret);
    }

    if config.allow_env_vars {
        if let Some(secret) = load_from_env(name) {
            return Ok(secret);
        }
    } else {
        warn!("Environment secrets disabled; {} must come from {}", name, file_var);
    }

    Err(SecretError::NotFound(name.to_string()))
}

/// Load a secret that the service can run without.
pub fn load_optional_secret(
    name: &str,
    config: &SecretConfig,
) -> Result<Option<Zeroizing<String>>, SecretError> {
    match load_secret(name, config) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn load_from_file(path: &str) -> Result<Zeroizing<String>, SecretError> {
    let raw = Zeroizing::new(fs::read_to_string(path).map_err(|e| SecretError::FileError {
        path: path.to_string(),
        reason: e.to_string(),
    })?);
    let secret = raw.trim();
    if secret.is_empty() {
        return Err(SecretError::FileError {
            path: path.to_string(),
            reason: "file is empty".to_string(),
        });
    }
    Ok(Zeroizing::new(secret.to_string()))
}

fn load_from_env(name: &str) -> Option<Zeroizing<String>> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(Zeroizing::new)
}

/// Reject secrets that are obviously placeholders.
pub fn validate_secret_strength(secret: &str, min_length: usize) -> Result<(), SecretError> {
    if secret.len() < min_length {
        return Err(SecretError::ValidationFailed(format!(
            "Secret too short: {} characters (minimum: {})",
            secret.len(),
            min_length
        )));
    }

    let weak_patterns = ["changeme", "placeholder", "your_api_key", "xxxx"];
    let secret_lower = secret.to_lowercase();
    for pattern in &weak_patterns {
        if secret_lower.contains(pattern) {
            return Err(SecretError::ValidationFailed(format!(
                "Secret contains placeholder pattern: {}",
                pattern
            )));
        }
    }

    Ok(())
}
