//! Credentials for git commands that talk to the remote.

use secrecy::ExposeSecret;
use std::path::PathBuf;

use crate::config::schema::{GitAuthSettings, GitAuthType};
use crate::gitops::error::{Result, SyncError};
use crate::secrets::{expand_home, resolve_secret};

/// Escapes a value for use inside single quotes in a POSIX shell script.
pub fn shell_escape(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Deletes the askpass script when dropped, so tokens never outlive the command.
#[derive(Debug, Default)]
pub struct AskpassCleanup {
    path: Option<PathBuf>,
}

impl Drop for AskpassCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to clean up askpass script: {}", e);
            }
        }
    }
}

/// Environment for an authenticated git command.
///
/// Must outlive the command it is applied to.
#[derive(Debug, Default)]
pub struct AuthEnv {
    pub env_vars: Vec<(String, String)>,
    _cleanup: AskpassCleanup,
}

/// Builds the git environment for `auth`.
pub fn build_auth_env(auth: &GitAuthSettings) -> Result<AuthEnv> {
    match auth.auth_type {
        GitAuthType::None => Ok(AuthEnv::default()),
        GitAuthType::Token => token_env(auth),
        GitAuthType::SshKey => ssh_key_env(auth),
    }
}

fn token_env(auth: &GitAuthSettings) -> Result<AuthEnv> {
    let token = resolve_secret(&auth.token_ref())
        .map_err(|e| SyncError::GitAuthFailed(format!("Failed to resolve git token: {}", e)))?;

    let path = std::env::temp_dir().join(format!(".stacksync-askpass-{}.sh", uuid::Uuid::new_v4()));
    let script = format!(
        "#!/bin/sh\necho '{}'\n",
        shell_escape(token.expose_secret())
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(&path)
            .map_err(|e| SyncError::GitAuthFailed(format!("Failed to write askpass script: {}", e)))?;
        std::io::Write::write_all(&mut file, script.as_bytes())
            .map_err(|e| SyncError::GitAuthFailed(format!("Failed to write askpass script: {}", e)))?;
    }

    #[cfg(not(unix))]
    std::fs::write(&path, &script)
        .map_err(|e| SyncError::GitAuthFailed(format!("Failed to write askpass script: {}", e)))?;

    let cleanup = AskpassCleanup {
        path: Some(path.clone()),
    };
    let path = path.to_str().map(str::to_string).ok_or_else(|| {
        SyncError::GitAuthFailed("Temp directory path contains non-UTF8 characters".to_string())
    })?;

    Ok(AuthEnv {
        env_vars: vec![
            ("GIT_ASKPASS".to_string(), path),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ],
        _cleanup: cleanup,
    })
}

fn ssh_key_env(auth: &GitAuthSettings) -> Result<AuthEnv> {
    let key_path = if auth.ssh_key_path.is_empty() {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("id_ed25519"))
            .unwrap_or_else(|| PathBuf::from(".ssh/id_ed25519"))
    } else {
        expand_home(&auth.ssh_key_path)
    };

    if !key_path.exists() {
        return Err(SyncError::GitAuthFailed(format!(
            "SSH key file not found: {}",
            key_path.display()
        )));
    }

    let escaped = shell_escape(&key_path.display().to_string());
    // A leading dash would be read as an ssh option
    let quoted = if escaped.starts_with('-') {
        format!("'./{}'", escaped)
    } else {
        format!("'{}'", escaped)
    };

    Ok(AuthEnv {
        env_vars: vec![(
            "GIT_SSH_COMMAND".to_string(),
            format!("ssh -i {} -o StrictHostKeyChecking=accept-new", quoted),
        )],
        _cleanup: AskpassCleanup::default(),
    })
}
