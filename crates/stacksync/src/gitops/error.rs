//! Sync-specific error types.

use std::path::PathBuf;
use thiserror::Error;

use super::resource::ResourceKey;

/// Errors that can occur while fetching desired state or mutating the target.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Failed to fetch desired state: {0}")]
    Fetch(String),

    #[error("Conflict applying {key}: {message}")]
    ApplyConflict { key: ResourceKey, message: String },

    #[error("Target rejected {key}: {message}")]
    ApplyRejected { key: ResourceKey, message: String },

    #[error("Operation on {key} timed out: {message}")]
    Timeout { key: ResourceKey, message: String },

    #[error("Resource not found: {0}")]
    DeleteNotFound(ResourceKey),

    #[error("Target environment error: {0}")]
    Target(String),

    #[error("Failed to read '{path}': {message}")]
    ReadFile { path: PathBuf, message: String },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Invalid resource in '{path}': {message}")]
    InvalidResource { path: PathBuf, message: String },

    #[error("Duplicate resource {key} in '{path}'")]
    DuplicateResource { key: ResourceKey, path: PathBuf },

    #[error("Manifest directory not found: {0}")]
    ManifestDirNotFound(PathBuf),

    #[error("Git operation failed: {0}")]
    GitOperation(String),

    #[error("Git network error: {0}")]
    GitNetworkError(String),

    #[error("Git operation timed out after {0}s")]
    GitTimeout(u64),

    #[error("Git repository not initialized")]
    GitNotInitialized,

    #[error("Git authentication failed: {0}")]
    GitAuthFailed(String),

    #[error("Watch error: {0}")]
    WatchError(String),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Target(err.to_string())
    }
}

impl SyncError {
    /// Returns true if the error is likely transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ApplyConflict { .. }
                | SyncError::Timeout { .. }
                | SyncError::GitNetworkError(_)
                | SyncError::GitTimeout(_)
        )
    }

    /// Short machine-readable name of the error kind, used in sync reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Fetch(_) => "FetchError",
            SyncError::ApplyConflict { .. } => "ApplyConflictError",
            SyncError::ApplyRejected { .. } => "ApplyRejectedError",
            SyncError::Timeout { .. } => "TimeoutError",
            SyncError::DeleteNotFound(_) => "DeleteNotFoundError",
            SyncError::Target(_) => "TargetError",
            SyncError::ReadFile { .. }
            | SyncError::ParseYaml { .. }
            | SyncError::InvalidResource { .. }
            | SyncError::DuplicateResource { .. }
            | SyncError::ManifestDirNotFound(_) => "ManifestError",
            SyncError::GitOperation(_)
            | SyncError::GitNetworkError(_)
            | SyncError::GitTimeout(_)
            | SyncError::GitNotInitialized
            | SyncError::GitAuthFailed(_) => "GitError",
            SyncError::WatchError(_) => "WatchError",
        }
    }

    /// Wraps a source-side failure so the sync aborts before any mutation.
    pub fn into_fetch(self) -> SyncError {
        match self {
            SyncError::Fetch(_) => self,
            other => SyncError::Fetch(other.to_string()),
        }
    }
}

/// Classifies a git stderr string into a more specific error variant.
pub fn classify_git_error(stderr: &str) -> SyncError {
    let lower = stderr.to_lowercase();

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return SyncError::GitNetworkError(stderr.trim().to_string());
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
    {
        return SyncError::GitAuthFailed(stderr.trim().to_string());
    }

    SyncError::GitOperation(stderr.trim().to_string())
}

/// Classifies kubectl stderr for an operation on `key`.
pub fn classify_kubectl_error(key: &ResourceKey, stderr: &str) -> SyncError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();

    if lower.contains("notfound") || lower.contains("not found") {
        return SyncError::DeleteNotFound(key.clone());
    }

    if lower.contains("the object has been modified") || lower.contains("conflict") {
        return SyncError::ApplyConflict {
            key: key.clone(),
            message,
        };
    }

    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection refused")
        || lower.contains("i/o timeout")
        || lower.contains("tls handshake")
        || lower.contains("etcdserver: request timed out")
    {
        return SyncError::Timeout {
            key: key.clone(),
            message,
        };
    }

    SyncError::ApplyRejected {
        key: key.clone(),
        message,
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ResourceKey {
        ResourceKey::new("Deployment", "demo", "api")
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ApplyConflict {
            key: key(),
            message: "modified".to_string()
        }
        .is_retryable());
        assert!(SyncError::Timeout {
            key: key(),
            message: "deadline".to_string()
        }
        .is_retryable());
        assert!(!SyncError::ApplyRejected {
            key: key(),
            message: "invalid".to_string()
        }
        .is_retryable());
        assert!(!SyncError::Fetch("unreachable".to_string()).is_retryable());
    }

    #[test]
    fn test_classify_git_network_error() {
        let err = classify_git_error("fatal: unable to access 'https://example.com/': Could not resolve host");
        assert!(matches!(err, SyncError::GitNetworkError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_git_auth_error() {
        let err = classify_git_error("remote: Authentication failed for 'https://example.com/'");
        assert!(matches!(err, SyncError::GitAuthFailed(_)));
    }

    #[test]
    fn test_classify_kubectl_errors() {
        let conflict = classify_kubectl_error(
            &key(),
            "Operation cannot be fulfilled on deployments.apps \"api\": the object has been modified",
        );
        assert!(matches!(conflict, SyncError::ApplyConflict { .. }));

        let missing = classify_kubectl_error(
            &key(),
            "Error from server (NotFound): deployments.apps \"api\" not found",
        );
        assert!(matches!(missing, SyncError::DeleteNotFound(_)));

        let timeout = classify_kubectl_error(&key(), "Unable to connect to the server: i/o timeout");
        assert!(matches!(timeout, SyncError::Timeout { .. }));

        let rejected = classify_kubectl_error(
            &key(),
            "The Deployment \"api\" is invalid: spec.replicas: Invalid value: -1",
        );
        assert!(matches!(rejected, SyncError::ApplyRejected { .. }));
    }

    #[test]
    fn test_into_fetch_wraps_source_errors() {
        let err = SyncError::GitNotInitialized.into_fetch();
        assert!(matches!(err, SyncError::Fetch(ref m) if m.contains("not initialized")));
        assert_eq!(err.kind(), "FetchError");
    }
}
