//! # Configuration Document Model
//!
//! Typed, validated in-memory form of an environment's declarative
//! configuration at one commit: map services with their ordered layers, and
//! the datasources those layers bind to.
//!
//! Documents are immutable snapshots keyed by (commit, environment path).
//! They serialize to JSON so the last successfully applied document can be
//! persisted next to the environment state and re-applied during rollback
//! without touching the repository.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Immutable configuration snapshot for one environment at one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationDocument {
    /// Commit this document was read from
    pub commit: String,
    /// Repository-relative environment path it was read under
    pub environment_path: String,
    /// Services keyed by id (BTreeMap keeps iteration deterministic)
    pub services: BTreeMap<String, Service>,
    /// Datasources keyed by id
    pub datasources: BTreeMap<String, Datasource>,
}

impl ConfigurationDocument {
    /// Empty document, used as the "old" side when an environment has never
    /// been deployed.
    #[must_use]
    pub fn empty(environment_path: &str) -> Self {
        Self {
            commit: String::new(),
            environment_path: environment_path.to_string(),
            services: BTreeMap::new(),
            datasources: BTreeMap::new(),
        }
    }

    /// Datasource ids referenced by at least one layer of an enabled service
    #[must_use]
    pub fn serving_datasources(&self) -> std::collections::BTreeSet<&str> {
        self.services
            .values()
            .filter(|s| s.enabled)
            .flat_map(|s| s.layers.iter().map(|l| l.datasource.as_str()))
            .collect()
    }
}

/// A published map service with its ordered layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Service {
    pub id: String,
    pub title: String,
    /// Disabled services keep their configuration but are not advertised
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Layer order is significant (draw order)
    #[serde(default)]
    pub layers: Vec<Layer>,
}

fn default_enabled() -> bool {
    true
}

/// One layer of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Layer {
    pub id: String,
    pub title: String,
    pub geometry_type: GeometryType,
    /// Id of the datasource this layer reads from
    pub datasource: String,
    pub key_mapping: KeyMapping,
    /// Free-form style reference
    #[serde(default)]
    pub style: Option<String>,
}

/// Geometry type served by a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GeometryType {
    Point,
    Line,
    Polygon,
    Multipoint,
    Multiline,
    Multipolygon,
    Raster,
}

/// How a layer's features map onto datasource columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeyMapping {
    pub id_column: String,
    pub geometry_column: String,
}

/// A datasource binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Datasource {
    pub id: String,
    /// Backend kind, e.g. "postgis", "geopackage"
    pub kind: String,
    pub connection: DatasourceConnection,
    /// Database schema to read from
    #[serde(default)]
    pub schema: Option<String>,
    /// Connection pool sizing
    #[serde(default)]
    pub pool: Option<PoolSettings>,
}

/// Where a datasource connects to. A change to any of these fields is a
/// migration: the serving backend moves to a different target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DatasourceConnection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Extra driver parameters
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

fn default_port() -> u16 {
    5432
}

impl DatasourceConnection {
    /// The (host, port, database) triple that identifies the connection
    /// target for migration detection. User and params changes are ordinary
    /// modifications.
    #[must_use]
    pub fn target(&self) -> (&str, u16, &str) {
        (&self.host, self.port, &self.database)
    }
}

/// Connection pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
}

/// Stable content hash of any serializable resource.
///
/// JSON serialization of these types is deterministic (struct field order
/// plus BTreeMap key order), so equal content always hashes equal.
pub fn content_hash<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{digest:x}")
}
