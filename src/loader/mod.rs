//! # Configuration Loader
//!
//! Reads the declarative files of one environment at one commit into a
//! typed, validated [`ConfigurationDocument`].
//!
//! ## Repository Layout
//!
//! ```text
//! <environment path>/
//!   services/*.yaml       one Service per file
//!   datasources/*.yaml    one Datasource per file
//! ```
//!
//! ## Validation
//!
//! Strict: unknown fields, duplicate ids, ids that don't match the resource
//! id charset, and layers referencing unknown datasources all fail the whole
//! load. No partial document is ever returned — a broken commit leaves the
//! environment on its last good configuration.
//!
//! Loading is pure given (commit, path), so documents are cached by commit.

pub mod document;

use crate::error::ReconcileError;
use crate::git::RepositoryMirror;
use document::{ConfigurationDocument, Datasource, Service};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{LazyLock, Mutex};
use tracing::debug;

static RESOURCE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("resource id regex is valid")
});

/// Cache size guard; documents are small but commits accumulate over a long
/// controller lifetime.
const MAX_CACHED_DOCUMENTS: usize = 16;

#[derive(Debug, Default)]
pub struct ConfigurationLoader {
    cache: Mutex<HashMap<String, ConfigurationDocument>>,
}

impl ConfigurationLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the environment's configuration at `commit`.
    pub async fn load(
        &self,
        mirror: &RepositoryMirror,
        commit: &str,
        environment_path: &str,
    ) -> Result<ConfigurationDocument, ReconcileError> {
        let cache_key = format!("{commit}:{environment_path}");
        if let Some(doc) = self.cache.lock().expect("loader cache poisoned").get(&cache_key) {
            debug!("Configuration cache hit for {}", cache_key);
            return Ok(doc.clone());
        }

        let files = mirror.read_tree(commit, environment_path).await?;
        let document = parse_document(commit, environment_path, &files)?;

        let mut cache = self.cache.lock().expect("loader cache poisoned");
        if cache.len() >= MAX_CACHED_DOCUMENTS {
            cache.clear();
        }
        cache.insert(cache_key, document.clone());

        Ok(document)
    }
}

/// Pure parsing step, separated from git access for testability.
pub fn parse_document(
    commit: &str,
    environment_path: &str,
    files: &[(String, Vec<u8>)],
) -> Result<ConfigurationDocument, ReconcileError> {
    let mut services: BTreeMap<String, Service> = BTreeMap::new();
    let mut datasources: BTreeMap<String, Datasource> = BTreeMap::new();

    for (path, bytes) in files {
        if !is_yaml(path) {
            continue;
        }
        let section = path
            .strip_prefix(environment_path)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(path);

        if section.starts_with("services/") {
            let service: Service = serde_yaml::from_slice(bytes).map_err(|e| {
                ReconcileError::Parse(format!("{path}: {e}"))
            })?;
            validate_id(&service.id, path)?;
            if services.insert(service.id.clone(), service).is_some() {
                return Err(ReconcileError::Parse(format!(
                    "{path}: duplicate service id"
                )));
            }
        } else if section.starts_with("datasources/") {
            let datasource: Datasource = serde_yaml::from_slice(bytes).map_err(|e| {
                ReconcileError::Parse(format!("{path}: {e}"))
            })?;
            validate_id(&datasource.id, path)?;
            if datasources
                .insert(datasource.id.clone(), datasource)
                .is_some()
            {
                return Err(ReconcileError::Parse(format!(
                    "{path}: duplicate datasource id"
                )));
            }
        }
        // Other files under the environment path (readme, styles) are not
        // part of the typed document
    }

    // Cross-file validation: every layer must bind to a declared datasource,
    // and layer ids must be unique within a service
    for service in services.values() {
        let mut layer_ids = std::collections::HashSet::new();
        for layer in &service.layers {
            validate_id(&layer.id, &format!("service '{}'", service.id))?;
            if !layer_ids.insert(layer.id.as_str()) {
                return Err(ReconcileError::Parse(format!(
                    "service '{}': duplicate layer id '{}'",
                    service.id, layer.id
                )));
            }
            if !datasources.contains_key(&layer.datasource) {
                return Err(ReconcileError::Parse(format!(
                    "service '{}': layer '{}' references unknown datasource '{}'",
                    service.id, layer.id, layer.datasource
                )));
            }
        }
    }

    Ok(ConfigurationDocument {
        commit: commit.to_string(),
        environment_path: environment_path.to_string(),
        services,
        datasources,
    })
}

fn is_yaml(path: &str) -> bool {
    path.ends_with(".yaml") || path.ends_with(".yml")
}

fn validate_id(id: &str, context: &str) -> Result<(), ReconcileError> {
    if RESOURCE_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(ReconcileError::Parse(format!(
            "{context}: invalid resource id '{id}': must match [a-z0-9][a-z0-9_-]*"
        )))
    }
}
