//! # Plan Builder
//!
//! Pure function computing a [`DeploymentPlan`] from two configuration
//! documents. No I/O, no clock, no randomness: identical inputs always
//! yield identical plans, which is what makes crash replay and approval
//! resumption safe — the pipeline can rebuild the exact same plan from the
//! recorded commits at any time.

use crate::config::policy::RiskLevel;
use crate::constants::DEFAULT_MODIFIED_RISK_THRESHOLD;
use crate::error::ReconcileError;
use crate::loader::document::{content_hash, ConfigurationDocument, Service};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What kind of resource a plan entry refers to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Datasource,
    Service,
}

/// Stable reference to one configured resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    #[must_use]
    pub fn service(id: &str) -> Self {
        Self {
            kind: ResourceKind::Service,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn datasource(id: &str) -> Self {
        Self {
            kind: ResourceKind::Datasource,
            id: id.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ResourceKind::Datasource => write!(f, "datasource/{}", self.id),
            ResourceKind::Service => write!(f, "service/{}", self.id),
        }
    }
}

/// Computed delta between two configuration snapshots plus risk metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlan {
    pub source_commit: String,
    pub target_commit: String,
    pub added: BTreeSet<ResourceRef>,
    pub modified: BTreeSet<ResourceRef>,
    pub removed: BTreeSet<ResourceRef>,
    /// Any datasource connection target changed
    pub has_migrations: bool,
    /// Any modified layer changed a structural identity field
    pub has_breaking_changes: bool,
    pub risk_level: RiskLevel,
}

impl DeploymentPlan {
    /// A plan with nothing to do short-circuits the pipeline straight to
    /// Completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// All refs touched by the plan, in deterministic order
    #[must_use]
    pub fn all_refs(&self) -> Vec<ResourceRef> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
            .cloned()
            .collect()
    }
}

/// Build a deployment plan from the currently deployed document (`old`) and
/// the candidate document (`new`).
pub fn build(
    old: &ConfigurationDocument,
    new: &ConfigurationDocument,
) -> Result<DeploymentPlan, ReconcileError> {
    let mut added = BTreeSet::new();
    let mut modified = BTreeSet::new();
    let mut removed = BTreeSet::new();
    let mut has_migrations = false;
    let mut has_breaking_changes = false;

    for (id, datasource) in &new.datasources {
        match old.datasources.get(id) {
            None => {
                added.insert(ResourceRef::datasource(id));
            }
            Some(previous) => {
                if content_hash(previous) != content_hash(datasource) {
                    modified.insert(ResourceRef::datasource(id));
                    if previous.connection.target() != datasource.connection.target() {
                        has_migrations = true;
                    }
                }
            }
        }
    }
    for id in old.datasources.keys() {
        if !new.datasources.contains_key(id) {
            removed.insert(ResourceRef::datasource(id));
        }
    }

    for (id, service) in &new.services {
        match old.services.get(id) {
            None => {
                added.insert(ResourceRef::service(id));
            }
            Some(previous) => {
                if content_hash(previous) != content_hash(service) {
                    modified.insert(ResourceRef::service(id));
                    if layers_structurally_differ(previous, service) {
                        has_breaking_changes = true;
                    }
                }
            }
        }
    }
    for id in old.services.keys() {
        if !new.services.contains_key(id) {
            removed.insert(ResourceRef::service(id));
        }
    }

    // Diff invariant: a ref can only be in one bucket
    if added.intersection(&modified).next().is_some()
        || added.intersection(&removed).next().is_some()
        || modified.intersection(&removed).next().is_some()
    {
        return Err(ReconcileError::Plan(
            "added/modified/removed sets overlap".to_string(),
        ));
    }

    let risk_level = classify_risk(
        old,
        &added,
        &modified,
        &removed,
        has_migrations,
        has_breaking_changes,
    );

    Ok(DeploymentPlan {
        source_commit: old.commit.clone(),
        target_commit: new.commit.clone(),
        added,
        modified,
        removed,
        has_migrations,
        has_breaking_changes,
        risk_level,
    })
}

/// A modified service is breaking when a layer kept by id changed its
/// geometry type, datasource reference, or key mapping — the structural
/// identity fields consumers depend on.
fn layers_structurally_differ(old: &Service, new: &Service) -> bool {
    for new_layer in &new.layers {
        if let Some(old_layer) = old.layers.iter().find(|l| l.id == new_layer.id) {
            if old_layer.geometry_type != new_layer.geometry_type
                || old_layer.datasource != new_layer.datasource
                || old_layer.key_mapping != new_layer.key_mapping
            {
                return true;
            }
        }
    }
    false
}

fn classify_risk(
    old: &ConfigurationDocument,
    added: &BTreeSet<ResourceRef>,
    modified: &BTreeSet<ResourceRef>,
    removed: &BTreeSet<ResourceRef>,
    has_migrations: bool,
    has_breaking_changes: bool,
) -> RiskLevel {
    if removed.iter().any(|r| is_serving(old, r)) {
        return RiskLevel::Critical;
    }
    if has_breaking_changes || has_migrations {
        return RiskLevel::High;
    }
    if modified.len() > DEFAULT_MODIFIED_RISK_THRESHOLD || !added.is_empty() {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

/// Whether a resource was actively serving in the deployed document:
/// an enabled service, or a datasource still referenced by one.
fn is_serving(old: &ConfigurationDocument, resource: &ResourceRef) -> bool {
    match resource.kind {
        ResourceKind::Service => old
            .services
            .get(&resource.id)
            .is_some_and(|s| s.enabled),
        ResourceKind::Datasource => old.serving_datasources().contains(resource.id.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::document::{
        Datasource, DatasourceConnection, GeometryType, KeyMapping, Layer, PoolSettings, Service,
    };
    use std::collections::BTreeMap;

    fn datasource(id: &str, host: &str) -> Datasource {
        Datasource {
            id: id.to_string(),
            kind: "postgis".to_string(),
            connection: DatasourceConnection {
                host: host.to_string(),
                port: 5432,
                database: "gis".to_string(),
                user: "geo".to_string(),
                params: BTreeMap::new(),
            },
            schema: None,
            pool: None,
        }
    }

    fn layer(id: &str, datasource: &str, geometry: GeometryType) -> Layer {
        Layer {
            id: id.to_string(),
            title: id.to_string(),
            geometry_type: geometry,
            datasource: datasource.to_string(),
            key_mapping: KeyMapping {
                id_column: "gid".to_string(),
                geometry_column: "geom".to_string(),
            },
            style: None,
        }
    }

    fn service(id: &str, enabled: bool, layers: Vec<Layer>) -> Service {
        Service {
            id: id.to_string(),
            title: id.to_string(),
            enabled,
            layers,
        }
    }

    fn doc(
        commit: &str,
        services: Vec<Service>,
        datasources: Vec<Datasource>,
    ) -> ConfigurationDocument {
        ConfigurationDocument {
            commit: commit.to_string(),
            environment_path: "environments/dev".to_string(),
            services: services.into_iter().map(|s| (s.id.clone(), s)).collect(),
            datasources: datasources.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    fn base() -> ConfigurationDocument {
        doc(
            "commit-a",
            vec![service(
                "cities",
                true,
                vec![layer("cities", "gis-main", GeometryType::Point)],
            )],
            vec![datasource("gis-main", "db.internal")],
        )
    }

    #[test]
    fn test_identical_documents_build_empty_plan() {
        let old = base();
        let mut new = base();
        new.commit = "commit-b".to_string();
        let plan = build(&old, &new).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.risk_level, RiskLevel::Low);
        assert_eq!(plan.source_commit, "commit-a");
        assert_eq!(plan.target_commit, "commit-b");
    }

    #[test]
    fn test_build_is_deterministic() {
        let old = base();
        let mut new = base();
        new.commit = "commit-b".to_string();
        new.services.insert(
            "roads".to_string(),
            service(
                "roads",
                true,
                vec![layer("roads", "gis-main", GeometryType::Line)],
            ),
        );
        let plan1 = build(&old, &new).unwrap();
        let plan2 = build(&old, &new).unwrap();
        assert_eq!(plan1, plan2);
        assert_eq!(
            serde_json::to_vec(&plan1).unwrap(),
            serde_json::to_vec(&plan2).unwrap()
        );
    }

    #[test]
    fn test_added_service_is_medium_risk() {
        let old = base();
        let mut new = base();
        new.commit = "commit-b".to_string();
        new.services.insert(
            "roads".to_string(),
            service(
                "roads",
                true,
                vec![layer("roads", "gis-main", GeometryType::Line)],
            ),
        );
        let plan = build(&old, &new).unwrap();
        assert!(plan.added.contains(&ResourceRef::service("roads")));
        assert_eq!(plan.risk_level, RiskLevel::Medium);
        assert!(!plan.has_breaking_changes);
        assert!(!plan.has_migrations);
    }

    #[test]
    fn test_connection_target_change_is_migration_and_high_risk() {
        let old = base();
        let mut new = base();
        new.commit = "commit-c".to_string();
        new.datasources
            .insert("gis-main".to_string(), datasource("gis-main", "db2.internal"));
        let plan = build(&old, &new).unwrap();
        assert!(plan.has_migrations);
        assert_eq!(plan.risk_level, RiskLevel::High);
        assert!(plan.modified.contains(&ResourceRef::datasource("gis-main")));
    }

    #[test]
    fn test_pool_change_is_plain_modification() {
        let old = base();
        let mut new = base();
        new.commit = "commit-c".to_string();
        let mut changed = datasource("gis-main", "db.internal");
        changed.pool = Some(PoolSettings {
            min_connections: 1,
            max_connections: 10,
        });
        new.datasources.insert("gis-main".to_string(), changed);
        let plan = build(&old, &new).unwrap();
        assert!(!plan.has_migrations);
        assert!(plan.modified.contains(&ResourceRef::datasource("gis-main")));
        assert_eq!(plan.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_geometry_type_change_is_breaking() {
        let old = base();
        let mut new = base();
        new.commit = "commit-c".to_string();
        new.services.insert(
            "cities".to_string(),
            service(
                "cities",
                true,
                vec![layer("cities", "gis-main", GeometryType::Polygon)],
            ),
        );
        let plan = build(&old, &new).unwrap();
        assert!(plan.has_breaking_changes);
        assert_eq!(plan.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_removing_serving_service_is_critical() {
        let old = base();
        let mut new = base();
        new.commit = "commit-d".to_string();
        new.services.clear();
        let plan = build(&old, &new).unwrap();
        assert!(plan.removed.contains(&ResourceRef::service("cities")));
        assert_eq!(plan.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_removing_disabled_service_is_not_critical() {
        let mut old = base();
        old.services.insert(
            "cities".to_string(),
            service(
                "cities",
                false,
                vec![layer("cities", "gis-main", GeometryType::Point)],
            ),
        );
        let mut new = old.clone();
        new.commit = "commit-d".to_string();
        new.services.clear();
        let plan = build(&old, &new).unwrap();
        assert_ne!(plan.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_removing_referenced_datasource_is_critical() {
        let old = base();
        let mut new = base();
        new.commit = "commit-d".to_string();
        // Keep the service but drop its datasource: the removed datasource
        // is still serving in the deployed document
        new.datasources.clear();
        let plan = build(&old, &new).unwrap();
        assert_eq!(plan.removed.len(), 1);
        assert_eq!(plan.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_title_only_change_is_low_risk() {
        let old = base();
        let mut new = base();
        new.commit = "commit-e".to_string();
        let mut changed = service(
            "cities",
            true,
            vec![layer("cities", "gis-main", GeometryType::Point)],
        );
        changed.title = "City centers".to_string();
        new.services.insert("cities".to_string(), changed);
        let plan = build(&old, &new).unwrap();
        assert!(plan.modified.contains(&ResourceRef::service("cities")));
        assert!(!plan.has_breaking_changes);
        assert_eq!(plan.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_many_modifications_are_medium_risk() {
        let mut old = base();
        let mut new = base();
        new.commit = "commit-f".to_string();
        for i in 0..6 {
            let id = format!("svc-{i}");
            old.services.insert(
                id.clone(),
                service(&id, true, vec![layer("l", "gis-main", GeometryType::Point)]),
            );
            let mut changed =
                service(&id, true, vec![layer("l", "gis-main", GeometryType::Point)]);
            changed.title = format!("changed {i}");
            new.services.insert(id, changed);
        }
        let plan = build(&old, &new).unwrap();
        assert_eq!(plan.modified.len(), 6);
        assert_eq!(plan.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_initial_deploy_from_empty_document() {
        let old = ConfigurationDocument::empty("environments/dev");
        let new = base();
        let plan = build(&old, &new).unwrap();
        assert_eq!(plan.added.len(), 2);
        assert!(plan.removed.is_empty());
        assert_eq!(plan.risk_level, RiskLevel::Medium);
    }
}
