//! Venue credential handling
//!
//! API credentials are held in `Zeroizing<String>` so they are wiped from
//! memory on drop, and never appear in `Debug` output. Each secret is read
//! from the 1Password CLI when an `op://` reference is configured, otherwise
//! from its environment variable.

use std::env;
use std::fmt;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

/// Error type for secret loading operations
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("1Password CLI error: {0}")]
    OnePasswordError(String),

    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

/// Bitget API key, secret and passphrase
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: Zeroizing<String>,
    pub api_secret: Zeroizing<String>,
    pub passphrase: Zeroizing<String>,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &redact(&self.api_key))
            .field("api_secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// First four characters of a key, enough to tell accounts apart in logs
fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    format!("{}…", prefix)
}

impl ApiCredentials {
    pub fn new(api_key: &str, api_secret: &str, passphrase: &str) -> Self {
        Self {
            api_key: Zeroizing::new(api_key.to_string()),
            api_secret: Zeroizing::new(api_secret.to_string()),
            passphrase: Zeroizing::new(passphrase.to_string()),
        }
    }

    /// Load from `BITGET_API_KEY`, `BITGET_API_SECRET`, `BITGET_API_PASSPHRASE`.
    ///
    /// `BITGET_API_KEY_OP`, `BITGET_API_SECRET_OP` and `BITGET_API_PASSPHRASE_OP`
    /// may hold 1Password references that take precedence.
    pub fn from_env() -> Result<Self, SecretError> {
        let api_key = load_secret("BITGET_API_KEY")?;
        let api_secret = load_secret("BITGET_API_SECRET")?;
        let passphrase = load_secret("BITGET_API_PASSPHRASE")?;

        validate_secret_strength(&api_key, 16)?;
        validate_secret_strength(&api_secret, 16)?;
        if passphrase.is_empty() {
            return Err(SecretError::ValidationFailed(
                "BITGET_API_PASSPHRASE is empty".to_string(),
            ));
        }

        Ok(Self {
            api_key,
            api_secret,
            passphrase,
        })
    }
}

/// Load one secret, preferring a 1Password reference in `<NAME>_OP`
pub fn load_secret(env_var_name: &str) -> Result<Zeroizing<String>, SecretError> {
    let op_var = format!("{}_OP", env_var_name);
    if let Ok(reference) = env::var(&op_var) {
        match load_from_op_cli(&reference) {
            Ok(secret) => {
                info!("Loaded secret from 1Password CLI: {}", env_var_name);
                return Ok(secret);
            }
            Err(e) => warn!("1Password CLI not available for {}: {}", env_var_name, e),
        }
    }

    load_from_env(env_var_name).map_err(|e| {
        error!("Secret loading failed for {}", env_var_name);
        e
    })
}

fn load_from_op_cli(reference: &str) -> Result<Zeroizing<String>, SecretError> {
    use std::process::Command;

    let output = Command::new("op")
        .arg("read")
        .arg(reference)
        .output()
        .map_err(|e| SecretError::OnePasswordError(format!("Failed to execute 'op': {}", e)))?;

    if !output.status.success() {
        let error_msg = String::from_utf8_lossy(&output.stderr);
        return Err(SecretError::OnePasswordError(format!(
            "1Password CLI failed: {}",
            error_msg
        )));
    }

    let secret = String::from_utf8(output.stdout)
        .map_err(|e| SecretError::OnePasswordError(format!("Invalid UTF-8 from 1Password: {}", e)))?
        .trim()
        .to_string();

    if secret.is_empty() {
        return Err(SecretError::NotFound(reference.to_string()));
    }

    Ok(Zeroizing::new(secret))
}

fn load_from_env(env_var_name: &str) -> Result<Zeroizing<String>, SecretError> {
    env::var(env_var_name)
        .map(|value| Zeroizing::new(value.trim().to_string()))
        .map_err(|_| SecretError::EnvVarNotSet(env_var_name.to_string()))
}

/// Reject secrets that are too short or obviously placeholders
pub fn validate_secret_strength(secret: &str, min_length: usize) -> Result<(), SecretError> {
    if secret.len() < min_length {
        return Err(SecretError::ValidationFailed(format!(
            "Secret too short: {} characters (minimum: {})",
            secret.len(),
            min_length
        )));
    }

    let weak_patterns = ["changeme", "placeholder", "your_api", "xxxx"];
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
