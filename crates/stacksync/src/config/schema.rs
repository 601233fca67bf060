//! Application resource definitions.
//!
//! An application file describes where the desired state lives, where it is
//! applied and which sync policy governs it:
//!
//! ```yaml
//! apiVersion: stacksync.io/v1
//! kind: Application
//! metadata:
//!   name: demo-stack
//! spec:
//!   source:
//!     type: git
//!     repoURL: https://github.com/example/deploy.git
//!     targetRevision: main
//!     path: k8s
//!   destination:
//!     namespace: demo
//!   syncPolicy:
//!     automated:
//!       prune: true
//!       selfHeal: true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gitops::policy::{RetryPolicy, SyncPolicy};
use crate::gitops::source::Destination;

/// API group of application resources.
pub const API_GROUP: &str = "stacksync.io";

/// API version of application resources.
pub const API_VERSION: &str = "stacksync.io/v1";

/// Kind of application resources.
pub const KIND_APPLICATION: &str = "Application";

/// Default Kubernetes API server address.
pub const DEFAULT_SERVER: &str = "https://kubernetes.default.svc";

/// A declared application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationResource {
    pub api_version: String,
    pub kind: String,
    pub metadata: ApplicationMeta,
    pub spec: ApplicationSpec,
}

impl ApplicationResource {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Application metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Desired application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub source: SourceSpec,

    #[serde(default)]
    pub destination: DestinationSpec,

    #[serde(default)]
    pub sync_policy: SyncPolicySpec,

    /// How often the source is polled for new revisions.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum concurrent resource operations per phase. Defaults to the CPU count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(180)
}

impl ApplicationSpec {
    pub fn sync_policy(&self) -> SyncPolicy {
        match &self.sync_policy.automated {
            Some(automated) => SyncPolicy {
                prune: automated.prune,
                self_heal: automated.self_heal,
                automated: true,
            },
            None => SyncPolicy::default(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.sync_policy.retry;
        RetryPolicy {
            limit: retry.limit,
            duration: retry.backoff.duration,
            factor: retry.backoff.factor,
            max_duration: retry.backoff.max_duration,
        }
    }

    pub fn destination(&self) -> Destination {
        Destination::new(&self.destination.server, &self.destination.namespace)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Kind of desired-state source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Git,
    Directory,
}

/// Where the desired state is read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(default, rename = "type")]
    pub source_type: SourceType,

    /// Remote repository URL (git sources).
    #[serde(
        default,
        rename = "repoURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub repo_url: Option<String>,

    /// Branch, tag or commit to follow (git sources).
    #[serde(default = "default_target_revision")]
    pub target_revision: String,

    /// Manifest directory inside the repository.
    #[serde(default = "default_source_path")]
    pub path: String,

    /// Manifest directory for directory sources, or the clone location for
    /// git sources. Relative paths resolve against the application file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,

    #[serde(default)]
    pub auth: GitAuthSettings,
}

fn default_target_revision() -> String {
    "main".to_string()
}

fn default_source_path() -> String {
    ".".to_string()
}

impl SourceSpec {
    /// Resolves `local_path` against `base_dir`, expanding `~`.
    pub fn resolved_local_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.local_path.as_deref().map(|p| {
            let expanded = crate::secrets::expand_home(p);
            if expanded.is_absolute() {
                expanded
            } else {
                base_dir.join(expanded)
            }
        })
    }
}

/// Git authentication settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAuthSettings {
    /// Authentication type: none, token, or ssh-key.
    #[serde(default, rename = "type")]
    pub auth_type: GitAuthType,

    /// Environment variable containing the token.
    #[serde(default)]
    pub token_env_var: String,

    /// Direct token value. Stored in plaintext in the application file.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "token")]
    pub token_insecure: Option<String>,

    /// Path to file containing the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    /// Path to SSH key file.
    #[serde(default)]
    pub ssh_key_path: String,
}

impl GitAuthSettings {
    /// Token locations for [`crate::secrets::resolve_secret`].
    pub fn token_ref(&self) -> crate::secrets::SecretRef<'_> {
        crate::secrets::SecretRef {
            value: self.token_insecure.as_deref(),
            file: self.token_file.as_deref(),
            env: Some(self.token_env_var.as_str()),
        }
    }
}

/// Git authentication type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitAuthType {
    #[default]
    None,
    Token,
    SshKey,
}

/// Where the desired state is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSpec {
    #[serde(default = "default_server")]
    pub server: String,

    /// Namespace for manifests that declare none.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// kubeconfig context to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// kubeconfig file to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,

    /// Kinds listed when looking for resources to prune.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,
}

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for DestinationSpec {
    fn default() -> Self {
        Self {
            server: default_server(),
            namespace: default_namespace(),
            context: None,
            kubeconfig: None,
            kinds: Vec::new(),
        }
    }
}

/// Sync policy block. An absent `automated` block disables all automation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<AutomatedSpec>,

    #[serde(default)]
    pub retry: RetrySpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedSpec {
    #[serde(default)]
    pub prune: bool,

    #[serde(default)]
    pub self_heal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    /// Retries after the first attempt.
    #[serde(default = "default_retry_limit")]
    pub limit: u32,

    #[serde(default)]
    pub backoff: BackoffSpec,
}

fn default_retry_limit() -> u32 {
    5
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            backoff: BackoffSpec::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffSpec {
    #[serde(default = "default_backoff_duration", with = "humantime_serde")]
    pub duration: Duration,

    #[serde(default = "default_backoff_factor")]
    pub factor: u32,

    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub max_duration: Duration,
}

fn default_backoff_duration() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(180)
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self {
            duration: default_backoff_duration(),
            factor: default_backoff_factor(),
            max_duration: default_backoff_max(),
        }
    }
}
