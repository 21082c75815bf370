//! Common utilities for end-to-end reconciliation tests
//!
//! Provides shared functionality for:
//! - Building throwaway git repositories with declarative configuration
//! - A scripted in-memory target-system adapter
//! - Wiring a complete per-environment pipeline against both

use geo_config_controller::approval::channel::{DecisionChannel, FileDecisionChannel};
use geo_config_controller::approval::ApprovalGate;
use geo_config_controller::apply::adapter::TargetSystemAdapter;
use geo_config_controller::apply::Applier;
use geo_config_controller::config::policy::DeploymentPolicy;
use geo_config_controller::config::EnvironmentConfig;
use geo_config_controller::controller::pipeline::EnvironmentRuntime;
use geo_config_controller::git::RepositoryMirror;
use geo_config_controller::loader::document::{ConfigurationDocument, Datasource};
use geo_config_controller::loader::ConfigurationLoader;
use geo_config_controller::plan::ResourceRef;
use geo_config_controller::state::store::StateStore;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const ENV_NAME: &str = "dev";
pub const ENV_PATH: &str = "environments/dev";

/// Throwaway git repository the mirror clones from
pub struct GitFixture {
    dir: TempDir,
}

impl GitFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create repo dir");
        let fixture = Self { dir };
        fixture.run(&["init", "--quiet"]);
        fixture.run(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        fixture.run(&["config", "user.email", "test@example.com"]);
        fixture.run(&["config", "user.name", "Test"]);
        fixture
    }

    pub fn url(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    pub fn write(&self, path: &str, content: &str) {
        let full = self.dir.path().join(path);
        std::fs::create_dir_all(full.parent().expect("file path has a parent"))
            .expect("create parent dirs");
        std::fs::write(full, content).expect("write repo file");
    }

    pub fn remove(&self, path: &str) {
        std::fs::remove_file(self.dir.path().join(path)).expect("remove repo file");
    }

    pub fn commit(&self, message: &str) -> String {
        self.run(&["add", "-A"]);
        self.run(&["commit", "--quiet", "-m", message]);
        self.run(&["rev-parse", "HEAD"]).trim().to_string()
    }

    fn run(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .arg("-C")
            .arg(self.dir.path())
            .args(args)
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).to_string()
    }
}

/// Scripted adapter recording every call the applier makes
#[derive(Default)]
pub struct MockAdapter {
    pub calls: Mutex<Vec<String>>,
    /// Fail every `rebind_datasource` for this id
    pub fail_rebind: Mutex<Option<String>>,
    /// Number of upcoming `reload_metadata` calls to fail
    pub fail_reloads: Mutex<u32>,
}

impl MockAdapter {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_next_reloads(&self, count: u32) {
        *self.fail_reloads.lock().unwrap() = count;
    }
}

#[async_trait::async_trait]
impl TargetSystemAdapter for MockAdapter {
    async fn rebind_datasource(&self, id: &str, _spec: &Datasource) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("rebind:{id}"));
        if self.fail_rebind.lock().unwrap().as_deref() == Some(id) {
            return Err(anyhow::anyhow!("connection refused"));
        }
        Ok(())
    }

    async fn reload_metadata(&self, _document: &ConfigurationDocument) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("reload".to_string());
        let mut remaining = self.fail_reloads.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(anyhow::anyhow!("metadata rejected"));
        }
        Ok(())
    }

    async fn invalidate_cache(&self, refs: &[ResourceRef]) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("invalidate:{}", refs.len()));
        Ok(())
    }
}

/// One fully wired environment pipeline over a git fixture and a scripted
/// adapter
pub struct TestContext {
    pub repo: GitFixture,
    pub adapter: Arc<MockAdapter>,
    pub channel: Arc<FileDecisionChannel>,
    pub runtime: EnvironmentRuntime,
    pub store: StateStore,
    _work: TempDir,
}

impl TestContext {
    pub fn new(policy: DeploymentPolicy) -> Self {
        let repo = GitFixture::new();
        let work = TempDir::new().expect("create work dir");
        let state_dir = work.path().join("state");
        let store = StateStore::new(&state_dir);
        store.ensure_layout().expect("state layout");

        let channel = Arc::new(FileDecisionChannel::new(&work.path().join("decisions")));
        let adapter = Arc::new(MockAdapter::default());

        let runtime = EnvironmentRuntime {
            environment: EnvironmentConfig {
                name: ENV_NAME.to_string(),
                path: ENV_PATH.to_string(),
                branch: None,
                policy,
            },
            branch: "main".to_string(),
            mirror: RepositoryMirror::new(
                &repo.url(),
                &work.path().join("mirror"),
                Duration::from_secs(30),
            ),
            loader: ConfigurationLoader::new(),
            store: store.clone(),
            gate: ApprovalGate::new(
                Arc::clone(&channel) as Arc<dyn DecisionChannel>
            ),
            applier: Applier::new(Arc::clone(&adapter) as Arc<dyn TargetSystemAdapter>),
        };

        Self {
            repo,
            adapter,
            channel,
            runtime,
            store,
            _work: work,
        }
    }

    pub fn state(&self) -> geo_config_controller::state::EnvironmentState {
        self.store
            .load_environment(ENV_NAME)
            .expect("read state")
            .expect("state exists")
    }
}

pub fn env_file(path: &str) -> String {
    format!("{ENV_PATH}/{path}")
}

/// Minimal valid datasource file body
pub fn datasource_yaml(id: &str, host: &str) -> String {
    format!(
        r#"id: {id}
kind: postgis
connection:
  host: {host}
  database: gis
  user: geo
"#
    )
}

/// Service with one layer bound to `datasource`
pub fn service_yaml(id: &str, datasource: &str) -> String {
    format!(
        r#"id: {id}
title: {id}
layers:
  - id: {id}
    title: {id}
    geometryType: line
    datasource: {datasource}
    keyMapping:
      idColumn: gid
      geometryColumn: geom
"#
    )
}

/// Seed the repository with one service + datasource and return the commit
pub fn seed_repo(repo: &GitFixture) -> String {
    repo.write(
        &env_file("datasources/gis-main.yaml"),
        &datasource_yaml("gis-main", "db.internal"),
    );
    repo.write(
        &env_file("services/cities.yaml"),
        &service_yaml("cities", "gis-main"),
    );
    repo.commit("seed environment")
}

impl Default for GitFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience: drop a file under the environment path
pub fn remove_env_file(repo: &GitFixture, path: &str) {
    repo.remove(&env_file(path));
}
