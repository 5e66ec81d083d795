//! Check implementations, one zero-sized type per [`CheckId`].
//!
//! `check_for()` maps a catalog id to a `&'static dyn Check`.

use async_trait::async_trait;

use crate::error::Result;

use super::catalog::{CheckId, Outcome};
use super::CheckContext;

mod capability;
mod cluster;
mod dns;
mod snapshot_restore;
mod storage;
mod tooling;

pub use capability::PodCapability;
pub use cluster::{
    ClusterAccess, CsiApis, KubernetesVersion, NamespacePermissions, Rbac, MIN_K8S_VERSION,
};
pub use dns::DnsResolution;
pub use snapshot_restore::{restored_data_matches, SnapshotPass, VolumeSnapshotRestore};
pub use storage::{is_legacy_non_snapshot_driver, select_snapshot_class, StorageSnapshotClass};
pub use tooling::{Helm, Kubectl, MIN_HELM_VERSION};

/// A single validation. `Err` means the check failed; the catalog loop logs
/// it and moves on.
#[async_trait]
pub trait Check: Send + Sync {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome>;
}

pub fn check_for(id: CheckId) -> &'static dyn Check {
    match id {
        CheckId::Kubectl => &Kubectl,
        CheckId::ClusterAccess => &ClusterAccess,
        CheckId::Helm => &Helm,
        CheckId::KubernetesVersion => &KubernetesVersion,
        CheckId::Rbac => &Rbac,
        CheckId::StorageSnapshotClass => &StorageSnapshotClass,
        CheckId::CsiApis => &CsiApis,
        CheckId::PodCapability => &PodCapability,
        CheckId::DnsResolution => &DnsResolution,
        CheckId::NamespacePermissions => &NamespacePermissions,
        CheckId::VolumeSnapshotRestore => &VolumeSnapshotRestore,
    }
}
