//! # Applier
//!
//! Pushes an accepted plan into the running server, resource group by
//! resource group, in fixed order: datasources first, then service/layer
//! metadata, then cache invalidation. A layer reload therefore never
//! references an unbound datasource.
//!
//! Fail-fast: the first failing group stops the rest, and any partial
//! failure is reported as a whole-deployment failure so the pipeline can
//! decide whether to roll back.

pub mod adapter;

use crate::error::ReconcileError;
use crate::loader::document::ConfigurationDocument;
use crate::plan::{DeploymentPlan, ResourceKind, ResourceRef};
use adapter::TargetSystemAdapter;
use std::sync::Arc;
use tracing::{error, info};

/// Result of one apply pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub succeeded: Vec<ResourceRef>,
    pub failed: Vec<ResourceRef>,
    pub error: Option<String>,
}

impl ApplyOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed.is_empty()
    }

    fn into_result(self) -> Result<Self, ReconcileError> {
        match &self.error {
            None => Ok(self),
            Some(message) => Err(ReconcileError::Apply(message.clone())),
        }
    }
}

#[derive(Clone)]
pub struct Applier {
    adapter: Arc<dyn TargetSystemAdapter>,
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier").finish_non_exhaustive()
    }
}

impl Applier {
    #[must_use]
    pub fn new(adapter: Arc<dyn TargetSystemAdapter>) -> Self {
        Self { adapter }
    }

    /// Apply `plan` with `document` as the desired end state.
    pub async fn apply(
        &self,
        plan: &DeploymentPlan,
        document: &ConfigurationDocument,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let mut succeeded = Vec::new();

        // Group 1: datasources, so later metadata reloads only see bound
        // datasources
        let datasource_refs: Vec<&ResourceRef> = plan
            .added
            .iter()
            .chain(plan.modified.iter())
            .filter(|r| r.kind == ResourceKind::Datasource)
            .collect();

        for resource in datasource_refs {
            let Some(spec) = document.datasources.get(&resource.id) else {
                return Self::fail(
                    succeeded,
                    plan,
                    format!("plan names {resource} but the document does not define it"),
                )
                .into_result();
            };
            if let Err(e) = self.adapter.rebind_datasource(&resource.id, spec).await {
                error!("Failed to rebind {}: {:#}", resource, e);
                return Self::fail(succeeded, plan, format!("{resource}: {e:#}")).into_result();
            }
            succeeded.push(resource.clone());
        }

        // Group 2: service/layer metadata, one converging reload covering
        // additions, modifications, and removals
        let service_refs: Vec<ResourceRef> = plan
            .all_refs()
            .into_iter()
            .filter(|r| r.kind == ResourceKind::Service)
            .collect();
        if !service_refs.is_empty() {
            if let Err(e) = self.adapter.reload_metadata(document).await {
                error!("Failed to reload metadata: {:#}", e);
                return Self::fail(succeeded, plan, format!("reload metadata: {e:#}"))
                    .into_result();
            }
            succeeded.extend(service_refs);
        }

        // Group 3: cache invalidation for everything the plan touched,
        // removed datasources included
        let all_refs = plan.all_refs();
        if !all_refs.is_empty() {
            if let Err(e) = self.adapter.invalidate_cache(&all_refs).await {
                error!("Failed to invalidate cache: {:#}", e);
                return Self::fail(succeeded, plan, format!("invalidate cache: {e:#}"))
                    .into_result();
            }
        }

        info!(
            "Applied plan {} -> {}: {} resources",
            plan.source_commit, plan.target_commit, succeeded.len()
        );
        Ok(ApplyOutcome {
            succeeded,
            failed: Vec::new(),
            error: None,
        })
    }

    /// Re-apply a complete configuration document unconditionally: every
    /// datasource rebound, metadata reloaded, all caches dropped. Used for
    /// rollback (from the persisted snapshot) and forced rollback, where
    /// the actual server state is unknown.
    pub async fn apply_full(
        &self,
        document: &ConfigurationDocument,
    ) -> Result<(), ReconcileError> {
        for (id, spec) in &document.datasources {
            self.adapter
                .rebind_datasource(id, spec)
                .await
                .map_err(|e| ReconcileError::Apply(format!("datasource/{id}: {e:#}")))?;
        }
        self.adapter
            .reload_metadata(document)
            .await
            .map_err(|e| ReconcileError::Apply(format!("reload metadata: {e:#}")))?;

        let refs: Vec<ResourceRef> = document
            .datasources
            .keys()
            .map(|id| ResourceRef::datasource(id))
            .chain(document.services.keys().map(|id| ResourceRef::service(id)))
            .collect();
        self.adapter
            .invalidate_cache(&refs)
            .await
            .map_err(|e| ReconcileError::Apply(format!("invalidate cache: {e:#}")))?;

        Ok(())
    }

    /// Build the failure outcome: everything the fail-fast stop never
    /// reached counts as failed.
    fn fail(succeeded: Vec<ResourceRef>, plan: &DeploymentPlan, message: String) -> ApplyOutcome {
        let failed: Vec<ResourceRef> = plan
            .all_refs()
            .into_iter()
            .filter(|r| !succeeded.contains(r))
            .collect();
        ApplyOutcome {
            succeeded,
            failed,
            error: Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::document::{Datasource, DatasourceConnection};
    use crate::plan;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Scripted adapter recording every call
    #[derive(Default)]
    pub struct MockAdapter {
        pub calls: Mutex<Vec<String>>,
        pub fail_rebind: Mutex<Option<String>>,
        pub fail_reload: Mutex<bool>,
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
            if *self.fail_reload.lock().unwrap() {
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

    fn document_with(ids: &[&str]) -> ConfigurationDocument {
        let mut doc = ConfigurationDocument::empty("environments/dev");
        doc.commit = "commit-b".to_string();
        for id in ids {
            doc.datasources.insert(
                (*id).to_string(),
                Datasource {
                    id: (*id).to_string(),
                    kind: "postgis".to_string(),
                    connection: DatasourceConnection {
                        host: "db.internal".to_string(),
                        port: 5432,
                        database: "gis".to_string(),
                        user: "geo".to_string(),
                        params: BTreeMap::new(),
                    },
                    schema: None,
                    pool: None,
                },
            );
        }
        doc
    }

    fn plan_adding(ids: &[&str]) -> DeploymentPlan {
        let old = ConfigurationDocument::empty("environments/dev");
        let new = document_with(ids);
        plan::build(&old, &new).unwrap()
    }

    #[tokio::test]
    async fn test_datasources_applied_before_cache_invalidation() {
        let adapter = Arc::new(MockAdapter::default());
        let applier = Applier::new(Arc::clone(&adapter) as Arc<dyn TargetSystemAdapter>);
        let doc = document_with(&["a", "b"]);
        let plan = plan_adding(&["a", "b"]);
        let outcome = applier.apply(&plan, &doc).await.unwrap();
        assert!(outcome.is_success());
        let calls = adapter.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["rebind:a", "rebind:b", "invalidate:2"]);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_after_first_failure() {
        let adapter = Arc::new(MockAdapter::default());
        *adapter.fail_rebind.lock().unwrap() = Some("a".to_string());
        let applier = Applier::new(Arc::clone(&adapter) as Arc<dyn TargetSystemAdapter>);
        let doc = document_with(&["a", "b"]);
        let plan = plan_adding(&["a", "b"]);
        let err = applier.apply(&plan, &doc).await.unwrap_err();
        assert_eq!(err.kind(), "apply");
        let calls = adapter.calls.lock().unwrap().clone();
        // b is never attempted, and no cache invalidation happens
        assert_eq!(calls, vec!["rebind:a"]);
    }

    #[tokio::test]
    async fn test_apply_full_rebinds_everything() {
        let adapter = Arc::new(MockAdapter::default());
        let applier = Applier::new(Arc::clone(&adapter) as Arc<dyn TargetSystemAdapter>);
        let doc = document_with(&["a", "b"]);
        applier.apply_full(&doc).await.unwrap();
        let calls = adapter.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["rebind:a", "rebind:b", "reload", "invalidate:2"]
        );
    }
}
