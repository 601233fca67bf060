//! Target environment backed by the `kubectl` CLI.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;

use super::TargetEnvironment;
use crate::gitops::error::{classify_kubectl_error, Result, SyncError};
use crate::gitops::git::parse::failure_message;
use crate::gitops::resource::{Comparison, ResourceDefinition, ResourceKey};

/// Label stamped on every applied object so prune only sees managed resources.
pub const TRACKING_LABEL: &str = "app.kubernetes.io/instance";

/// Kinds listed when computing the live set of a namespace.
const DEFAULT_KINDS: &[&str] = &[
    "deployments.apps",
    "statefulsets.apps",
    "services",
    "configmaps",
    "secrets",
    "persistentvolumeclaims",
    "ingresses.networking.k8s.io",
    "certificates.cert-manager.io",
];

/// Talks to a cluster through `kubectl`.
pub struct KubectlTarget {
    instance: String,
    context: Option<String>,
    kubeconfig: Option<PathBuf>,
    kinds: Vec<String>,
    timeout: Duration,
}

impl KubectlTarget {
    /// Creates a target that tracks objects with `instance` as tracking label value.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            context: None,
            kubeconfig: None,
            kinds: DEFAULT_KINDS.iter().map(|k| k.to_string()).collect(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Replaces the kinds queried by `list`.
    pub fn with_kinds(mut self, kinds: Vec<String>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new("kubectl");
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.arg(format!("--request-timeout={}s", self.timeout.as_secs().max(1)));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        key: &ResourceKey,
        mut cmd: TokioCommand,
        stdin: Option<Vec<u8>>,
    ) -> Result<Output> {
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SyncError::Target(format!("failed to run kubectl: {}", e)))?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&bytes).await?;
                // Closing stdin lets kubectl start processing
                drop(pipe);
            }
        }

        // Allow a little slack over kubectl's own request timeout
        let deadline = self.timeout + Duration::from_secs(5);
        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(SyncError::Timeout {
                key: key.clone(),
                message: format!("kubectl did not finish within {}s", deadline.as_secs()),
            }),
        }
    }

    fn parse_items(stdout: &[u8]) -> Result<Vec<ResourceDefinition>> {
        let value: serde_json::Value = serde_json::from_slice(stdout)
            .map_err(|e| SyncError::Target(format!("invalid kubectl output: {}", e)))?;

        let items = match value.get("items") {
            Some(serde_json::Value::Array(items)) => items.clone(),
            _ => vec![value],
        };

        items
            .into_iter()
            .map(|item| ResourceDefinition::from_value(item).map_err(SyncError::Target))
            .collect()
    }
}

#[async_trait]
impl TargetEnvironment for KubectlTarget {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceDefinition>> {
        let mut cmd = self.command();
        cmd.args([
            "get",
            key.kind.as_str(),
            key.name.as_str(),
            "--ignore-not-found",
            "-o",
            "json",
        ]);
        if key.is_namespaced() {
            cmd.args(["-n", key.namespace.as_str()]);
        }

        let output = self.run(key, cmd, None).await?;
        if !output.status.success() {
            let err = classify_kubectl_error(key, &String::from_utf8_lossy(&output.stderr));
            if matches!(err, SyncError::DeleteNotFound(_)) {
                return Ok(None);
            }
            return Err(err);
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        Ok(Self::parse_items(&output.stdout)?.into_iter().next())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<ResourceDefinition>> {
        // Only namespaced kinds are tracked; cluster-scoped objects are never pruned
        if namespace.is_empty() {
            return Ok(Vec::new());
        }

        let selector = format!("{}={}", TRACKING_LABEL, self.instance);
        let kinds = self.kinds.join(",");
        let key = ResourceKey::new("List", namespace, &self.instance);

        let mut cmd = self.command();
        cmd.args([
            "get",
            kinds.as_str(),
            "-l",
            selector.as_str(),
            "-n",
            namespace,
            "-o",
            "json",
        ]);

        let output = self.run(&key, cmd, None).await?;
        if !output.status.success() {
            return Err(SyncError::Target(failure_message(&output)));
        }

        let definitions = Self::parse_items(&output.stdout)?;
        Ok(definitions
            .into_iter()
            .filter(|d| d.namespace() == namespace)
            .collect())
    }

    async fn apply(&self, definition: &ResourceDefinition) -> Result<()> {
        let key = definition.key();

        let mut labelled = definition.clone();
        labelled
            .metadata
            .labels
            .insert(TRACKING_LABEL.to_string(), self.instance.clone());
        let payload = serde_json::to_vec(&labelled)
            .map_err(|e| SyncError::Target(format!("failed to encode {}: {}", key, e)))?;

        let mut cmd = self.command();
        cmd.args(["apply", "-f", "-"]);

        let output = self.run(&key, cmd, Some(payload)).await?;
        if output.status.success() {
            log::debug!(
                "kubectl apply {}: {}",
                key,
                String::from_utf8_lossy(&output.stdout).trim()
            );
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(match classify_kubectl_error(&key, &stderr) {
            // A missing namespace or CRD is a rejection of this definition
            SyncError::DeleteNotFound(key) => SyncError::ApplyRejected {
                key,
                message: stderr.trim().to_string(),
            },
            other => other,
        })
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["delete", key.kind.as_str(), key.name.as_str(), "--wait=false"]);
        if key.is_namespaced() {
            cmd.args(["-n", key.namespace.as_str()]);
        }

        let output = self.run(key, cmd, None).await?;
        if output.status.success() {
            return Ok(());
        }

        Err(classify_kubectl_error(key, &String::from_utf8_lossy(&output.stderr)))
    }

    fn comparison(&self) -> Comparison {
        Comparison::DeclaredFields
    }
}
