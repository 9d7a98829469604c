//! Resolution of the remote index API key.
//!
//! The key can come from three places, checked in order:
//!
//! 1. **Inline** in the config (`api_key`), handy for a quick local try
//! 2. **File** (`api_key_file`), e.g. a mounted secret
//! 3. **Environment variable** (`api_key_env`, default `SHELFSYNC_API_KEY`)

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;

/// Environment variable consulted when the config names none.
pub const DEFAULT_API_KEY_ENV: &str = "SHELFSYNC_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No API key configured (set api_key, api_key_file, or the SHELFSYNC_API_KEY variable)")]
    NoSourceProvided,

    #[error("Failed to read API key from file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("API key file '{path}' is empty")]
    EmptyFile { path: String },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Where the API key may be found. Embedded in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeySource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ApiKeySource {
    /// Resolves the key, falling back to [`DEFAULT_API_KEY_ENV`] when no
    /// source is configured at all.
    pub fn resolve(&self) -> Result<SecretString> {
        let env_var = match self.api_key_env.as_deref() {
            Some(name) if !name.is_empty() => Some(name),
            _ if !self.has_explicit_source() => Some(DEFAULT_API_KEY_ENV),
            _ => None,
        };
        resolve_secret(
            self.api_key.as_deref(),
            self.api_key_file.as_deref(),
            env_var,
        )
        .map_err(|e| match e {
            SecretError::EnvVarNotSet { ref name }
                if name == DEFAULT_API_KEY_ENV && !self.has_explicit_source() =>
            {
                SecretError::NoSourceProvided
            }
            other => other,
        })
    }

    fn has_explicit_source(&self) -> bool {
        [&self.api_key, &self.api_key_file, &self.api_key_env]
            .iter()
            .any(|s| s.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

/// Resolves a secret from an inline value, then a file, then an
/// environment variable. Empty sources are ignored.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = file_path.filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        let content = fs::read_to_string(&expanded).map_err(|source| SecretError::FileRead {
            path: expanded.clone(),
            source,
        })?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SecretError::EmptyFile { path: expanded });
        }
        return Ok(SecretString::from(trimmed.to_string()));
    }

    if let Some(name) = env_var.filter(|n| !n.is_empty()) {
        return match std::env::var(name) {
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Expands a leading `~` to the home directory. `~user` is not supported.
pub fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            if path == "~" {
                return home.to_string_lossy().into_owned();
            }
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
