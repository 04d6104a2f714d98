//! API key loading.
//!
//! The key is read once at process start, from the optional secrets file
//! (a flat TOML table such as `.streamlit/secrets.toml`) and then from the
//! environment. It lives in a [`Secret`], whose `Debug` and `Display`
//! never print the value, and only ever leaves the process in a request
//! header.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::Path;

use crate::config::SecretsConfig;

#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

/// Resolves the API key: secrets file first, then the environment
/// variable named `key_name`.
pub fn load_api_key(config: &SecretsConfig) -> Result<Secret> {
    if let Some(path) = &config.file {
        if let Some(secret) = read_secrets_file(path, &config.key_name)? {
            return Ok(secret);
        }
    }

    match std::env::var(&config.key_name) {
        Ok(value) if !value.trim().is_empty() => Ok(Secret::new(value.trim())),
        _ => bail!(
            "{} not set (looked in {} and the environment)",
            config.key_name,
            config
                .file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "no secrets file".to_string())
        ),
    }
}

fn read_secrets_file(path: &Path, key_name: &str) -> Result<Option<Secret>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read secrets file: {}", path.display()))?;
    let table: toml::Table = toml::from_str(&content)
        .with_context(|| format!("Failed to parse secrets file: {}", path.display()))?;

    Ok(table
        .get(key_name)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Secret::new))
}
