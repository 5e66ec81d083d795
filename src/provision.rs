//! Submits preflight objects to the cluster and waits for them to settle.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cluster::ClusterContext;
use crate::error::{Error, Result};
use crate::helpers::check_mark;
use crate::wait::{
    wait_until_pod_deleted, wait_until_pod_ready, wait_until_snapshot_ready, Backoff,
};

/// Grace period used for every delete issued by this crate.
pub const DELETION_GRACE_PERIOD_SECONDS: u32 = 5;

/// Log an object the API server refused, as YAML, so the user can see what
/// was submitted.
pub(crate) fn log_rejected<T: Serialize>(kind: &str, name: &str, obj: &T) {
    match serde_yaml::to_string(obj) {
        Ok(yaml) => warn!(kind, name, "Failed to create {kind}. Object yaml:\n{yaml}"),
        Err(e) => warn!(kind, name, error = %e, "error converting object to yaml"),
    }
}

/// Remove finalizers (best effort) and delete `name` with a short grace
/// period. A missing object counts as deleted.
pub(crate) async fn force_delete<K>(api: &Api<K>, kind: &str, name: &str, has_finalizers: bool) -> Result<()>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    if has_finalizers {
        let patch = json!({ "metadata": { "finalizers": null } });
        if let Err(e) = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(kind, name, error = %e, "failed to remove finalizers, deleting anyway");
        }
    }

    let params = DeleteParams {
        grace_period_seconds: Some(DELETION_GRACE_PERIOD_SECONDS),
        ..Default::default()
    };
    match api.delete(name, &params).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            debug!(kind, name, "already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Creates pods, PVCs and VolumeSnapshots for one run and waits on them.
pub struct Provisioner<'a> {
    ctx: &'a ClusterContext,
    namespace: String,
    backoff: Backoff,
}

impl<'a> Provisioner<'a> {
    pub fn new(ctx: &'a ClusterContext, namespace: impl Into<String>) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            backoff: Backoff::default_retry(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace)
    }

    /// Create `pod` and block until it reports `Ready`.
    pub async fn create_pod_and_wait(&self, pod: &Pod) -> Result<Pod> {
        let name = pod.name_any();
        let pods = self.pods();
        if let Err(e) = pods.create(&PostParams::default(), pod).await {
            log_rejected("Pod", &name, pod);
            return Err(e.into());
        }
        info!(pod = %name, namespace = %self.namespace, "Created pod");

        info!(pod = %name, "Waiting for pod to become ready");
        if let Err(e) =
            wait_until_pod_ready(&self.ctx.client, &self.backoff, &self.namespace, &name).await
        {
            warn!(pod = %name, error = %e, "pod failed to reach ready state");
            return Err(e);
        }

        let ready = pods.get(&name).await?;
        let node = ready
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or("<unknown>");
        info!(pod = %name, node, "Pod has reached ready state");
        Ok(ready)
    }

    pub async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let name = pvc.name_any();
        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(self.ctx.client.clone(), &self.namespace);
        match pvcs.create(&PostParams::default(), pvc).await {
            Ok(created) => {
                info!(pvc = %name, namespace = %self.namespace, "Created pvc");
                Ok(created)
            }
            Err(e) => {
                log_rejected("PersistentVolumeClaim", &name, pvc);
                Err(e.into())
            }
        }
    }

    /// Create a VolumeSnapshot and wait until it is `readyToUse`.
    pub async fn create_snapshot_and_wait(
        &self,
        ar: &ApiResource,
        snapshot: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = snapshot.name_any();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.ctx.client.clone(), &self.namespace, ar);
        let created = match api.create(&PostParams::default(), snapshot).await {
            Ok(created) => created,
            Err(e) => {
                log_rejected("VolumeSnapshot", &name, snapshot);
                return Err(Error::check(format!(
                    "error creating volume snapshot {name} :: {e}"
                )));
            }
        };
        let source = snapshot
            .data
            .pointer("/spec/source/persistentVolumeClaimName")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        info!(snapshot = %name, pvc = source, "Created volume snapshot");

        info!(snapshot = %name, "Waiting for volume snapshot to become 'readyToUse:true'");
        wait_until_snapshot_ready(&self.ctx.client, ar, &self.backoff, &self.namespace, &name)
            .await?;
        info!(snapshot = %name, "{} volume snapshot is ready-to-use", check_mark());
        Ok(created)
    }

    /// Delete a pod, stripping finalizers first, and wait until the API
    /// server no longer has it. Only then is its volume detached.
    pub async fn delete_pod(&self, name: &str) -> Result<()> {
        let pods = self.pods();
        let has_finalizers = match pods.get_opt(name).await? {
            Some(pod) => pod
                .meta()
                .finalizers
                .as_ref()
                .is_some_and(|f| !f.is_empty()),
            None => return Ok(()),
        };
        force_delete(&pods, "Pod", name, has_finalizers).await?;

        info!(pod = %name, "Waiting for pod to be deleted");
        wait_until_pod_deleted(&self.ctx.client, &self.backoff, &self.namespace, name).await?;
        info!(pod = %name, "Deleted pod");
        Ok(())
    }
}
