use async_trait::async_trait;
use kube::api::ApiResource;
use kube::ResourceExt;
use tracing::info;

use crate::cluster::VOLUME_SNAPSHOT_KIND;
use crate::error::{Error, Result};
use crate::exec::{exec_in_pod, ExecOptions};
use crate::helpers::check_mark;
use crate::preflight::catalog::Outcome;
use crate::preflight::CheckContext;
use crate::provision::Provisioner;
use crate::resources::{
    resource_name, restore_pod, restore_pvc, source_pod, source_pvc, volume_snapshot,
    BUSYBOX_CONTAINER, DATA_FILE_CONTENT, DATA_FILE_PATH, RESTORE_POD_PREFIX,
    RESTORE_PVC_PREFIX, SOURCE_SNAPSHOT_PREFIX, UNMOUNTED_RESTORE_POD_PREFIX,
    UNMOUNTED_RESTORE_PVC_PREFIX, UNMOUNTED_SNAPSHOT_PREFIX,
};

use super::Check;

/// Write data, snapshot it, restore it, read it back. Done twice: once while
/// the source volume is mounted and once after its pod is gone.
///
/// Everything created here is left for the cleanup pass.
pub struct VolumeSnapshotRestore;

/// Which of the two snapshot/restore rounds is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotPass {
    /// Source pod still mounts the volume.
    Mounted,
    /// Source pod deleted first.
    Unmounted,
}

impl SnapshotPass {
    fn prefixes(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::Mounted => (SOURCE_SNAPSHOT_PREFIX, RESTORE_PVC_PREFIX, RESTORE_POD_PREFIX),
            Self::Unmounted => (
                UNMOUNTED_SNAPSHOT_PREFIX,
                UNMOUNTED_RESTORE_PVC_PREFIX,
                UNMOUNTED_RESTORE_POD_PREFIX,
            ),
        }
    }

    pub fn success_message(self) -> &'static str {
        match self {
            Self::Mounted => "Restored pod has expected data",
            Self::Unmounted => "Restored pod from volume snapshot of unmounted pv has expected data",
        }
    }
}

/// `cat` output of the marker file matches what the source pod wrote.
/// Only the newline `echo` appends is ignored.
pub fn restored_data_matches(stdout: &str) -> bool {
    stdout.trim_end_matches('\n') == DATA_FILE_CONTENT
}

/// Read the marker file in `pod_name` and compare it with what was written.
pub(crate) async fn verify_restored_data(ctx: &CheckContext<'_>, pod_name: &str) -> Result<()> {
    let options = ExecOptions {
        namespace: ctx.provision.namespace.clone(),
        pod_name: pod_name.to_string(),
        container_name: BUSYBOX_CONTAINER.to_string(),
        command: vec!["cat".to_string(), DATA_FILE_PATH.to_string()],
    };
    let response = exec_in_pod(&ctx.cluster.executor, &options, ctx.exec_timeout).await?;
    if !restored_data_matches(&response.stdout) {
        return Err(Error::check(format!(
            "restored data in pod {pod_name} does not match :: expected '{DATA_FILE_CONTENT}', found '{}'",
            response.stdout.trim_end_matches('\n')
        )));
    }
    Ok(())
}

struct RoundTrip<'c, 'a> {
    ctx: &'c CheckContext<'a>,
    provisioner: Provisioner<'a>,
    ar: ApiResource,
    snapshot_class: String,
}

impl RoundTrip<'_, '_> {
    /// Snapshot `source_pvc`, restore it into a new PVC + pod and check the
    /// marker file survived.
    async fn snapshot_restore_verify(&self, source_pvc: &str, pass: SnapshotPass) -> Result<()> {
        let spec = &self.ctx.provision;
        let uid = self.ctx.uid.as_str();
        let (snapshot_prefix, pvc_prefix, pod_prefix) = pass.prefixes();

        let snapshot_name = resource_name(snapshot_prefix, uid);
        let snapshot = volume_snapshot(
            &self.ar,
            spec,
            &snapshot_name,
            &self.snapshot_class,
            source_pvc,
            uid,
        );
        self.provisioner
            .create_snapshot_and_wait(&self.ar, &snapshot)
            .await?;

        let pvc_name = resource_name(pvc_prefix, uid);
        self.provisioner
            .create_pvc(&restore_pvc(spec, &pvc_name, &snapshot_name, uid))
            .await?;
        let pod_name = resource_name(pod_prefix, uid);
        self.provisioner
            .create_pod_and_wait(&restore_pod(spec, &pod_name, &pvc_name, uid))
            .await?;

        verify_restored_data(self.ctx, &pod_name).await?;
        info!(
            pod = %pod_name,
            pvc = %pvc_name,
            "{} {}",
            check_mark(),
            pass.success_message()
        );
        Ok(())
    }
}

#[async_trait]
impl Check for VolumeSnapshotRestore {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        let snapshot_class = ctx.snapshot_class.clone().ok_or_else(|| {
            Error::check(format!(
                "no volume snapshot class resolved for storage class {}",
                ctx.options.storage_class
            ))
        })?;
        let ar = ctx.cluster.snapshot_api_resource(VOLUME_SNAPSHOT_KIND).await?;
        let ctx: &CheckContext<'_> = ctx;
        let round_trip = RoundTrip {
            ctx,
            provisioner: ctx.provisioner(),
            ar,
            snapshot_class,
        };
        let provisioner = &round_trip.provisioner;

        let pvc = provisioner
            .create_pvc(&source_pvc(&ctx.provision, &ctx.uid))
            .await?;
        let pvc_name = pvc.name_any();
        let source = provisioner
            .create_pod_and_wait(&source_pod(&ctx.provision, &pvc_name, &ctx.uid))
            .await?;
        info!(pvc = %pvc_name, pod = %source.name_any(), "Source pod has written data to pvc");

        round_trip
            .snapshot_restore_verify(&pvc_name, SnapshotPass::Mounted)
            .await?;

        // delete_pod returns once the pod is gone, so nothing mounts the PVC
        // when the second snapshot is taken.
        provisioner.delete_pod(&source.name_any()).await?;
        round_trip
            .snapshot_restore_verify(&pvc_name, SnapshotPass::Unmounted)
            .await?;

        Ok(Outcome::Passed)
    }
}
