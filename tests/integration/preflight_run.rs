//! Whole runs against envtest. Pods never become Ready here, so the pod
//! capability, DNS and snapshot/restore checks fail after a short backoff;
//! every other check is expected to pass.

use tvk_preflight::error::Error;
use tvk_preflight::preflight::{CheckId, CheckStatus, Preflight, RunOptions};

use crate::common::*;

async fn run_options(ctx: &TestContext, cleanup_on_failure: bool) -> RunOptions {
    let sc = format!("{}-sc", ctx.ns);
    create_storage_class(&ctx.client, &sc, &ctx.driver()).await;
    create_snapshot_class(&ctx.client, &format!("{}-snap", ctx.ns), &ctx.driver(), true).await;
    RunOptions {
        storage_class: sc,
        namespace: ctx.ns.clone(),
        in_cluster: true,
        cleanup_on_failure,
        ..Default::default()
    }
}

#[tokio::test]
async fn failed_run_cleans_up_when_asked() {
    let ctx = TestContext::new().await;
    let options = run_options(&ctx, true).await;

    let report = Preflight::new(&ctx.cluster, options)
        .with_backoff(fast_backoff())
        .run()
        .await
        .expect("run should not fail to start");

    assert!(!report.succeeded());
    assert_eq!(report.status_of(CheckId::Kubectl), CheckStatus::Skipped);
    assert_eq!(report.status_of(CheckId::Helm), CheckStatus::Skipped);
    assert_eq!(report.status_of(CheckId::ClusterAccess), CheckStatus::Passed);
    assert_eq!(report.status_of(CheckId::Rbac), CheckStatus::Passed);
    assert_eq!(
        report.status_of(CheckId::StorageSnapshotClass),
        CheckStatus::Passed
    );
    assert_eq!(report.status_of(CheckId::CsiApis), CheckStatus::Passed);
    assert_eq!(report.status_of(CheckId::PodCapability), CheckStatus::Failed);
    assert_eq!(report.status_of(CheckId::DnsResolution), CheckStatus::Failed);
    assert_eq!(
        report.status_of(CheckId::NamespacePermissions),
        CheckStatus::Passed
    );
    assert_eq!(
        report.status_of(CheckId::VolumeSnapshotRestore),
        CheckStatus::Failed
    );

    assert!(
        wait_for_no_labelled(&ctx.client, &ctx.ns, Some(&report.uid)).await,
        "cleanup-on-failure left resources behind"
    );
}

#[tokio::test]
async fn failed_run_keeps_resources_by_default() {
    let ctx = TestContext::new().await;
    let options = run_options(&ctx, false).await;

    let report = Preflight::new(&ctx.cluster, options)
        .with_backoff(fast_backoff())
        .run()
        .await
        .expect("run should not fail to start");
    assert!(!report.succeeded());

    let uid = report.uid.as_str();
    let mut pods = labelled_pods(&ctx.client, &ctx.ns, Some(uid)).await;
    pods.sort();
    assert_eq!(
        pods,
        vec![
            format!("dnsutils-{uid}"),
            format!("pod-capability-0-{uid}"),
            format!("source-pod-{uid}"),
        ]
    );
    assert_eq!(
        labelled_pvcs(&ctx.client, &ctx.ns, Some(uid)).await,
        vec![format!("source-pvc-{uid}")]
    );
}

#[tokio::test]
async fn missing_storage_class_option_is_a_setup_error() {
    let ctx = TestContext::new().await;
    let options = RunOptions {
        namespace: ctx.ns.clone(),
        ..Default::default()
    };
    let err = Preflight::new(&ctx.cluster, options).run().await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err}");
}
