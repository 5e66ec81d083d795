use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DynamicObject, ListParams};
use kube::ResourceExt;
use tracing::{error, info};

use crate::cluster::{snapshot_api_resource_at, SNAPSHOT_GROUP, VOLUME_SNAPSHOT_CLASS_KIND};
use crate::error::{Error, Result};
use crate::helpers::check_mark;
use crate::preflight::catalog::Outcome;
use crate::preflight::CheckContext;

use super::Check;

pub const DEFAULT_SNAPSHOT_CLASS_ANNOTATION: &str = "snapshot.storage.kubernetes.io/is-default-class";

const LEGACY_NON_SNAPSHOT_DRIVERS: [&str; 7] = [
    "kubernetes.io/aws-ebs",
    "kubernetes.io/azure-disk",
    "kubernetes.io/gce-pd",
    "kubernetes.io/vsphere-volume",
    "kubernetes.io/cinder",
    "kubernetes.io/host-path",
    "kubernetes.io/no-provisioner",
];

/// In-tree provisioners that cannot take CSI snapshots.
pub fn is_legacy_non_snapshot_driver(provisioner: &str) -> bool {
    LEGACY_NON_SNAPSHOT_DRIVERS.contains(&provisioner)
}

fn driver_of(class: &DynamicObject) -> Option<&str> {
    class.data.get("driver").and_then(|d| d.as_str())
}

fn is_default(class: &DynamicObject) -> bool {
    class
        .annotations()
        .get(DEFAULT_SNAPSHOT_CLASS_ANNOTATION)
        .is_some_and(|v| v == "true")
}

/// Pick the VolumeSnapshotClass to use for `provisioner`.
///
/// A matching class marked default wins; otherwise the last matching class
/// in list order.
pub fn select_snapshot_class(classes: &[DynamicObject], provisioner: &str) -> Option<String> {
    let matching: Vec<&DynamicObject> = classes
        .iter()
        .filter(|c| driver_of(c) == Some(provisioner))
        .collect();
    matching
        .iter()
        .find(|c| is_default(c))
        .or_else(|| matching.last())
        .map(|c| c.name_any())
}

/// StorageClass exists and a VolumeSnapshotClass with the same driver is
/// available. The chosen class is stored on the context for the
/// snapshot/restore check.
pub struct StorageSnapshotClass;

impl StorageSnapshotClass {
    async fn resolve(ctx: &CheckContext<'_>) -> Result<String> {
        let client = ctx.cluster.client.clone();
        let storage_class = &ctx.options.storage_class;

        let storage_classes: Api<StorageClass> = Api::all(client.clone());
        let sc = storage_classes
            .get_opt(storage_class)
            .await?
            .ok_or_else(|| {
                Error::check(format!("not found storageclass - {storage_class} on cluster"))
            })?;
        let provisioner = sc.provisioner.as_str();
        info!(storage_class = %storage_class, provisioner, "{} Storageclass found on cluster", check_mark());

        if is_legacy_non_snapshot_driver(provisioner) {
            error!(
                provisioner,
                "Provisioner '{provisioner}' is a legacy driver that does not support snapshots. Consider migrating to a CSI driver."
            );
        }

        let version = ctx
            .cluster
            .preferred_version_for_group(SNAPSHOT_GROUP)
            .await?
            .ok_or_else(|| {
                Error::check(format!("API group {SNAPSHOT_GROUP} not found on cluster"))
            })?;
        let ar = snapshot_api_resource_at(VOLUME_SNAPSHOT_CLASS_KIND, &version);
        let classes: Api<DynamicObject> = Api::all_with(client, &ar);

        match ctx.options.snapshot_class.as_deref().filter(|c| !c.is_empty()) {
            None => {
                let listed = classes.list(&ListParams::default()).await?.items;
                let name = select_snapshot_class(&listed, provisioner).ok_or_else(|| {
                    Error::check(format!(
                        "no volume snapshot class having driver same as provisioner - {provisioner} found on cluster"
                    ))
                })?;
                info!(
                    snapshot_class = %name,
                    provisioner,
                    "{} Volume snapshot class driver matches with given StorageClass's provisioner",
                    check_mark()
                );
                Ok(name)
            }
            Some(name) => {
                let class = classes.get_opt(name).await?.ok_or_else(|| {
                    Error::check(format!("volume snapshot class - {name} not found on cluster"))
                })?;
                if driver_of(&class) != Some(provisioner) {
                    return Err(Error::check(format!(
                        "volume snapshot class - {name} driver does not match with given StorageClass's provisioner={provisioner}"
                    )));
                }
                info!(
                    snapshot_class = %name,
                    "{} Volume snapshot class driver matches with given storage class provisioner",
                    check_mark()
                );
                Ok(name.to_string())
            }
        }
    }
}

#[async_trait]
impl Check for StorageSnapshotClass {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        match Self::resolve(ctx).await {
            Ok(name) => {
                ctx.snapshot_class = Some(name);
                Ok(Outcome::Passed)
            }
            Err(e) => {
                error!("Recommendations:");
                error!("1. Verify CSI driver supports snapshots");
                error!("2. Check snapshot controller logs");
                error!("3. Check CSI driver documentation for snapshot requirements");
                Err(e)
            }
        }
    }
}
