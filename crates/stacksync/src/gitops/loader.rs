//! Manifest loader for multi-file, multi-document YAML directories.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::error::{Result, SyncError};
use super::resource::{ResourceDefinition, ResourceKey};

/// Raw manifest file read from a source, path relative to the source root.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub content: String,
}

/// Returns true if `relative` names a YAML file outside hidden directories.
pub fn is_manifest_path(relative: &Path) -> bool {
    let has_hidden_component = relative.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
    });
    if has_hidden_component {
        return false;
    }

    let ext = relative.extension().and_then(|e| e.to_str()).unwrap_or("");
    ext == "yaml" || ext == "yml"
}

/// Parses every YAML document in `content` into resource definitions.
///
/// Empty documents are skipped and `*List` documents are flattened through
/// their `items`. Namespaced kinds without a namespace get `default_namespace`.
pub fn parse_documents(
    content: &str,
    path: &Path,
    default_namespace: &str,
) -> Result<Vec<ResourceDefinition>> {
    let mut definitions = Vec::new();

    for document in serde_yaml::Deserializer::from_str(content) {
        let value =
            serde_json::Value::deserialize(document).map_err(|e| SyncError::ParseYaml {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        if value.is_null() {
            continue;
        }

        let is_list = value
            .get("kind")
            .and_then(|k| k.as_str())
            .is_some_and(|k| k.ends_with("List"))
            && value.get("items").is_some_and(|i| i.is_array());

        let items = if is_list {
            match value.get("items") {
                Some(serde_json::Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            }
        } else {
            vec![value]
        };

        for item in items {
            let mut definition =
                ResourceDefinition::from_value(item).map_err(|message| {
                    SyncError::InvalidResource {
                        path: path.to_path_buf(),
                        message,
                    }
                })?;
            definition.default_namespace(default_namespace);
            definitions.push(definition);
        }
    }

    Ok(definitions)
}

/// Parses a set of manifest files, rejecting duplicate keys.
///
/// Source order is preserved: files in the given order, documents in file order.
pub fn collect_definitions(
    files: &[ManifestFile],
    default_namespace: &str,
) -> Result<Vec<ResourceDefinition>> {
    let mut seen: HashMap<ResourceKey, PathBuf> = HashMap::new();
    let mut definitions = Vec::new();

    for file in files {
        for definition in parse_documents(&file.content, &file.path, default_namespace)? {
            let key = definition.key();
            if seen.contains_key(&key) {
                return Err(SyncError::DuplicateResource {
                    key,
                    path: file.path.clone(),
                });
            }
            seen.insert(key, file.path.clone());
            definitions.push(definition);
        }
    }

    Ok(definitions)
}

/// Loads manifests from a local directory.
pub struct ManifestLoader {
    root: PathBuf,
    default_namespace: String,
}

impl ManifestLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_namespace: String::new(),
        }
    }

    /// Namespace given to namespaced resources that do not declare one.
    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads every manifest file under the root, sorted by relative path.
    pub fn read_files(&self) -> Result<Vec<ManifestFile>> {
        if !self.root.is_dir() {
            return Err(SyncError::ManifestDirNotFound(self.root.clone()));
        }

        let mut files = Vec::new();

        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let relative = match path.strip_prefix(&self.root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => continue,
            };
            if !is_manifest_path(&relative) {
                continue;
            }

            let content = fs::read_to_string(path).map_err(|e| SyncError::ReadFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

            files.push(ManifestFile {
                path: relative,
                content,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Loads all resource definitions under the root.
    pub fn load(&self) -> Result<Vec<ResourceDefinition>> {
        let files = self.read_files()?;
        let definitions = collect_definitions(&files, &self.default_namespace)?;
        log::debug!(
            "Loaded {} resources from {} files in {}",
            definitions.len(),
            files.len(),
            self.root.display()
        );
        Ok(definitions)
    }
}
