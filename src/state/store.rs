//! # Deployment State Store
//!
//! Durable, crash-safe persistence for per-environment state.
//!
//! Every write goes to a temp file in the same directory and is renamed
//! into place, so external readers (health checks, `geoctl`, anything
//! tailing the well-known path) never observe partial content. Readers are
//! lock-free and tolerate brief staleness; only the owning pipeline writes
//! its environment's documents.
//!
//! Layout:
//!
//! ```text
//! <state_dir>/<environment>.json            environment state document
//! <state_dir>/snapshots/<environment>.json  last successfully applied
//!                                           configuration document
//! ```
//!
//! The snapshot is what rollback re-applies — deliberately not a fresh
//! repository read, so rollback works while the repository is unreachable.

use crate::error::ReconcileError;
use crate::loader::document::ConfigurationDocument;
use crate::state::EnvironmentState;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }

    /// Create the on-disk layout. Called once at startup.
    pub fn ensure_layout(&self) -> Result<(), ReconcileError> {
        fs::create_dir_all(self.snapshots_dir())
            .map_err(|e| ReconcileError::StateStore(format!("creating state layout: {e}")))
    }

    /// Well-known path of an environment's state document.
    #[must_use]
    pub fn environment_path(&self, environment: &str) -> PathBuf {
        self.state_dir.join(format!("{environment}.json"))
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }

    fn snapshot_path(&self, environment: &str) -> PathBuf {
        self.snapshots_dir().join(format!("{environment}.json"))
    }

    /// Load an environment's state, or `None` if it has never been written.
    /// A present-but-unreadable document is an error, never silently
    /// replaced: the state file is the source of truth.
    pub fn load_environment(
        &self,
        environment: &str,
    ) -> Result<Option<EnvironmentState>, ReconcileError> {
        read_json(&self.environment_path(environment))
    }

    /// Atomically persist an environment's state.
    pub fn save_environment(&self, state: &EnvironmentState) -> Result<(), ReconcileError> {
        let path = self.environment_path(&state.environment);
        write_json_atomic(&path, state)?;
        debug!("Persisted state for {} at {}", state.environment, path.display());
        Ok(())
    }

    /// Load the last successfully applied configuration document.
    pub fn load_snapshot(
        &self,
        environment: &str,
    ) -> Result<Option<ConfigurationDocument>, ReconcileError> {
        read_json(&self.snapshot_path(environment))
    }

    /// Atomically persist the configuration document that was just applied
    /// successfully. This is the rollback source.
    pub fn save_snapshot(
        &self,
        environment: &str,
        document: &ConfigurationDocument,
    ) -> Result<(), ReconcileError> {
        write_json_atomic(&self.snapshot_path(environment), document)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ReconcileError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            ReconcileError::StateStore(format!("corrupt document {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ReconcileError::StateStore(format!(
            "reading {}: {e}",
            path.display()
        ))),
    }
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), ReconcileError> {
    let dir = path.parent().ok_or_else(|| {
        ReconcileError::StateStore(format!("{} has no parent directory", path.display()))
    })?;

    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| ReconcileError::StateStore(format!("serializing {}: {e}", path.display())))?;

    // Temp file in the same directory so the rename is atomic on the same
    // filesystem
    let mut temp = NamedTempFile::new_in(dir)
        .map_err(|e| ReconcileError::StateStore(format!("creating temp file in {}: {e}", dir.display())))?;
    temp.write_all(&bytes)
        .and_then(|()| temp.flush())
        .map_err(|e| ReconcileError::StateStore(format!("writing {}: {e}", path.display())))?;
    temp.persist(path)
        .map_err(|e| ReconcileError::StateStore(format!("renaming into {}: {e}", path.display())))?;

    Ok(())
}
