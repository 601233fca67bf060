//! Semantic validation of application resources.
//!
//! The JSON schema covers shape and types; the checks here cover values the
//! schema cannot express well.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use super::loader::LoadedApplication;
use super::schema::{ApplicationResource, GitAuthType, SourceType};
use crate::error::ConfigError;

// DNS-1123 label: lowercase alphanumerics and '-', starting and ending alphanumeric
static RE_DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

const MAX_NAME_LEN: usize = 63;
const MAX_RETRY_LIMIT: u32 = 20;
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Validator for application resources.
#[derive(Default)]
pub struct ApplicationValidator {
    errors: Vec<String>,
}

impl ApplicationValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a set of loaded applications, including name uniqueness.
    pub fn validate_all(&mut self, applications: &[LoadedApplication]) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for loaded in applications {
            if !seen.insert(loaded.application.name()) {
                return Err(ConfigError::DuplicateApplication {
                    name: loaded.application.name().to_string(),
                    path: loaded.path.clone(),
                });
            }
            self.validate(&loaded.application)?;
        }
        Ok(())
    }

    /// Validates one application.
    pub fn validate(&mut self, app: &ApplicationResource) -> Result<(), ConfigError> {
        self.errors.clear();

        self.validate_name(app.name());
        self.validate_source(app);
        self.validate_destination(app);
        self.validate_sync_policy(app);

        if app.spec.poll_interval < MIN_POLL_INTERVAL {
            self.errors.push(format!(
                "pollInterval must be at least 1s, got {}ms",
                app.spec.poll_interval.as_millis()
            ));
        }

        if app.spec.concurrency == Some(0) {
            self.errors
                .push("concurrency must be greater than 0".to_string());
        }

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::InvalidApplication {
                name: app.name().to_string(),
                reason: self.errors.join("; "),
            })
        }
    }

    fn validate_name(&mut self, name: &str) {
        if name.len() > MAX_NAME_LEN {
            self.errors.push(format!(
                "metadata.name must be at most {} characters",
                MAX_NAME_LEN
            ));
        }
        if !RE_DNS_LABEL.is_match(name) {
            self.errors.push(format!(
                "metadata.name '{}' must consist of lowercase alphanumerics and '-'",
                name
            ));
        }
    }

    fn validate_source(&mut self, app: &ApplicationResource) {
        let source = &app.spec.source;

        if source.path.trim().is_empty() {
            self.errors.push("source.path must not be empty".to_string());
        }
        if source.path.split('/').any(|segment| segment == "..") {
            self.errors
                .push("source.path must not contain '..'".to_string());
        }

        match source.source_type {
            SourceType::Git => {
                if source.repo_url.as_deref().is_none_or(|u| u.trim().is_empty()) {
                    self.errors
                        .push("source.repoURL is required for git sources".to_string());
                }
                if source.target_revision.trim().is_empty() {
                    self.errors
                        .push("source.targetRevision must not be empty".to_string());
                }
                if source.auth.auth_type == GitAuthType::Token
                    && !source.auth.token_ref().is_configured()
                {
                    self.errors.push(
                        "token auth needs one of token, tokenFile or tokenEnvVar".to_string(),
                    );
                }
            }
            SourceType::Directory => {
                if source.local_path.is_none() {
                    self.errors
                        .push("source.localPath is required for directory sources".to_string());
                }
            }
        }
    }

    fn validate_destination(&mut self, app: &ApplicationResource) {
        let namespace = &app.spec.destination.namespace;
        if namespace.is_empty() {
            self.errors
                .push("destination.namespace must not be empty".to_string());
        } else if !RE_DNS_LABEL.is_match(namespace) {
            self.errors.push(format!(
                "destination.namespace '{}' is not a valid namespace name",
                namespace
            ));
        }
    }

    fn validate_sync_policy(&mut self, app: &ApplicationResource) {
        let retry = &app.spec.sync_policy.retry;

        if retry.limit == 0 || retry.limit > MAX_RETRY_LIMIT {
            self.errors.push(format!(
                "syncPolicy.retry.limit must be between 1 and {}",
                MAX_RETRY_LIMIT
            ));
        }
        if retry.backoff.factor == 0 {
            self.errors
                .push("syncPolicy.retry.backoff.factor must be at least 1".to_string());
        }
        if retry.backoff.max_duration < retry.backoff.duration {
            self.errors.push(
                "syncPolicy.retry.backoff.maxDuration must not be below duration".to_string(),
            );
        }
    }
}
