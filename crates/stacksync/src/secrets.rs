//! Secret lookup for repository credentials.
//!
//! An application may point at its git token in three places. The first one
//! that is set wins: an inline value, a file, then an environment variable.

use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("no token configured (set token, tokenFile or tokenEnvVar)")]
    Missing,

    #[error("cannot read token file '{}': {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("token variable '{0}' is not set")]
    EnvUnset(String),

    #[error("token variable '{0}' is not valid UTF-8")]
    EnvNotUnicode(String),
}

/// Where a secret may be found. Empty strings count as unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretRef<'a> {
    pub value: Option<&'a str>,
    pub file: Option<&'a str>,
    pub env: Option<&'a str>,
}

impl<'a> SecretRef<'a> {
    fn value(&self) -> Option<&'a str> {
        self.value.filter(|v| !v.is_empty())
    }

    fn file(&self) -> Option<&'a str> {
        self.file.filter(|v| !v.is_empty())
    }

    fn env(&self) -> Option<&'a str> {
        self.env.filter(|v| !v.is_empty())
    }

    pub fn is_configured(&self) -> bool {
        self.value().is_some() || self.file().is_some() || self.env().is_some()
    }
}

/// Reads the secret `secret` points at. Surrounding whitespace is trimmed.
pub fn resolve_secret(secret: &SecretRef<'_>) -> Result<SecretString, SecretError> {
    let raw = if let Some(value) = secret.value() {
        value.to_string()
    } else if let Some(file) = secret.file() {
        let path = expand_home(file);
        std::fs::read_to_string(&path).map_err(|source| SecretError::ReadFile { path, source })?
    } else if let Some(name) = secret.env() {
        std::env::var(name).map_err(|e| match e {
            std::env::VarError::NotPresent => SecretError::EnvUnset(name.to_string()),
            std::env::VarError::NotUnicode(_) => SecretError::EnvNotUnicode(name.to_string()),
        })?
    } else {
        return Err(SecretError::Missing);
    };

    Ok(SecretString::from(raw.trim().to_string()))
}

/// Replaces a leading `~` with the home directory. `~user` is left alone.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}
