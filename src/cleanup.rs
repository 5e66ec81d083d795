//! Cleanup engine: find everything carrying the preflight labels and remove
//! it.
//!
//! Deletion is best effort. A resource that cannot be deleted is recorded and
//! the sweep carries on; the call fails at the end if anything was recorded.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cluster::{snapshot_api_resource_at, ClusterContext, SNAPSHOT_GROUP, VOLUME_SNAPSHOT_KIND};
use crate::error::{Error, Result};
use crate::helpers::{cross_mark, label_selector};
use crate::provision::force_delete;

/// Options for the `cleanup` subcommand and the `cleanup:` config section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupOptions {
    /// Run identity to clean. `None` cleans every preflight run.
    pub uid: Option<String>,
    pub namespace: String,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            uid: None,
            namespace: "default".into(),
        }
    }
}

/// Outcome of a sweep that fully succeeded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// `Kind/name` of every deleted object.
    pub deleted: Vec<String>,
}

/// Kinds the sweep looks at, in deletion order.
///
/// VolumeSnapshot is resolved at the cluster's preferred version and left
/// out when the snapshot API is not served.
pub async fn cleanup_targets(cluster: &ClusterContext) -> Result<Vec<ApiResource>> {
    let mut targets = vec![
        ApiResource::erase::<Pod>(&()),
        ApiResource::erase::<PersistentVolumeClaim>(&()),
    ];
    match cluster.preferred_version_for_group(SNAPSHOT_GROUP).await? {
        Some(version) => targets.push(snapshot_api_resource_at(VOLUME_SNAPSHOT_KIND, &version)),
        None => warn!(
            group = SNAPSHOT_GROUP,
            "snapshot API not served by the cluster, skipping {VOLUME_SNAPSHOT_KIND} cleanup"
        ),
    }
    Ok(targets)
}

pub struct Cleanup<'a> {
    cluster: &'a ClusterContext,
    namespace: String,
}

impl<'a> Cleanup<'a> {
    pub fn new(cluster: &'a ClusterContext, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    /// Delete every labelled resource of one run, or of all runs when `uid`
    /// is `None`.
    pub async fn cleanup_preflight_resources(&self, uid: Option<&str>) -> Result<CleanupSummary> {
        let uid = uid.filter(|u| !u.is_empty());
        match uid {
            Some(uid) => info!(uid, namespace = %self.namespace, "Cleaning preflight resources with uid - {uid}"),
            None => info!(namespace = %self.namespace, "Cleaning all preflight resources"),
        }

        let selector = label_selector(uid);
        let params = ListParams::default().labels(&selector);
        let mut summary = CleanupSummary::default();
        let mut failed = Vec::new();

        for ar in cleanup_targets(self.cluster).await? {
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.cluster.client.clone(), &self.namespace, &ar);
            let items = match api.list(&params).await {
                Ok(list) => list.items,
                Err(e) => {
                    error!(kind = %ar.kind, error = %e, "Error fetching {}(s)", ar.kind);
                    failed.push(format!("{} (list)", ar.kind));
                    continue;
                }
            };

            for obj in items {
                let name = obj.name_any();
                info!(kind = %ar.kind, name = %name, "Cleaning {} - {name}", ar.kind);
                let has_finalizers = !obj.finalizers().is_empty();
                match force_delete(&api, &ar.kind, &name, has_finalizers).await {
                    Ok(()) => summary.deleted.push(format!("{}/{name}", ar.kind)),
                    Err(e) => {
                        error!(
                            kind = %ar.kind,
                            name = %name,
                            "{} Error cleaning {} - {name} :: {e}",
                            cross_mark(),
                            ar.kind
                        );
                        failed.push(format!("{}/{name}", ar.kind));
                    }
                }
            }
        }

        if !failed.is_empty() {
            return Err(Error::Cleanup { failed });
        }
        match uid {
            Some(uid) => info!(uid, deleted = summary.deleted.len(), "preflight resources cleaned for uid - {uid}"),
            None => info!(deleted = summary.deleted.len(), "All preflight resources cleaned"),
        }
        Ok(summary)
    }
}
