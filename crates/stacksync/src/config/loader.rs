use serde::Deserialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::schema::{ApplicationResource, API_GROUP, KIND_APPLICATION};
use crate::config::validation::ApplicationValidator;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/application-v1.json");

/// An application together with the file it was declared in.
#[derive(Debug, Clone)]
pub struct LoadedApplication {
    pub application: ApplicationResource,
    pub path: PathBuf,
}

impl LoadedApplication {
    /// Directory relative `localPath` values resolve against.
    pub fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Loads every application from a YAML file or a directory of YAML files.
///
/// Files may hold several documents separated by `---`. Directories are
/// walked recursively in file name order, skipping hidden entries. Inside a
/// directory, documents that are not `stacksync.io` Applications are ignored,
/// so manifests may live next to the applications that deploy them.
pub fn load_applications<P: AsRef<Path>>(path: P) -> Result<Vec<LoadedApplication>, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let (files, foreign) = if path.is_dir() {
        (application_files(path)?, Documents::SkipForeign)
    } else {
        (vec![path.to_path_buf()], Documents::Strict)
    };

    let mut applications = Vec::new();
    for file in files {
        let content = std::fs::read_to_string(&file).map_err(|e| ConfigError::ReadFile {
            path: file.clone(),
            source: e,
        })?;

        for application in parse_applications(&content, &file, foreign)? {
            applications.push(LoadedApplication {
                application,
                path: file.clone(),
            });
        }
    }

    ApplicationValidator::new().validate_all(&applications)?;

    log::info!(
        "Loaded {} application(s) from {}",
        applications.len(),
        path.display()
    );
    Ok(applications)
}

/// Parses and validates the applications in one YAML text.
///
/// `path` is only used in error messages. Empty documents are skipped.
pub fn load_applications_from_str(
    content: &str,
    path: &Path,
) -> Result<Vec<ApplicationResource>, ConfigError> {
    parse_applications(content, path, Documents::Strict)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Documents {
    /// Every document must be an Application.
    Strict,
    /// Documents of another apiVersion group or kind are skipped.
    SkipForeign,
}

fn is_application_document(value: &serde_json::Value) -> bool {
    let group = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .and_then(|v| v.split('/').next());
    let kind = value.get("kind").and_then(|v| v.as_str());
    group == Some(API_GROUP) && kind == Some(KIND_APPLICATION)
}

fn parse_applications(
    content: &str,
    path: &Path,
    documents: Documents,
) -> Result<Vec<ApplicationResource>, ConfigError> {
    let mut applications = Vec::new();

    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_json::Value::deserialize(document).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if value.is_null() {
            continue;
        }

        if documents == Documents::SkipForeign && !is_application_document(&value) {
            log::debug!("Skipping non-application document in {}", path.display());
            continue;
        }

        validate_schema(&value, path)?;

        let application: ApplicationResource =
            serde_json::from_value(value).map_err(|source| ConfigError::Decode {
                path: path.to_path_buf(),
                source,
            })?;

        ApplicationValidator::new().validate(&application)?;
        applications.push(application);
    }

    Ok(applications)
}

fn application_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();

    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry.map_err(|e| ConfigError::ReadFile {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
            source: e.into(),
        })?;

        let is_yaml = entry
            .path()
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if entry.file_type().is_file() && is_yaml {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

fn validate_schema(value: &serde_json::Value, path: &Path) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if !errors.is_empty() {
        return Err(ConfigError::SchemaValidation {
            path: path.to_path_buf(),
            errors: errors.join("; "),
        });
    }

    Ok(())
}
