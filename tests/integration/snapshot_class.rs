//! Snapshot class discovery and the read-only cluster checks.

use tvk_preflight::error::Result;
use tvk_preflight::preflight::{check_for, Check, CheckContext, CheckId, Outcome, RunOptions};

use crate::common::*;

fn options(storage_class: &str, snapshot_class: Option<&str>) -> RunOptions {
    RunOptions {
        storage_class: storage_class.to_string(),
        snapshot_class: snapshot_class.map(str::to_string),
        ..Default::default()
    }
}

/// Run the SnapshotClass check and return its result plus the class it
/// stored for later checks.
async fn resolve(ctx: &TestContext, options: &RunOptions) -> (Result<Outcome>, Option<String>) {
    let mut check_ctx = CheckContext::new(&ctx.cluster, options, "abcdef");
    let result = check_for(CheckId::StorageSnapshotClass)
        .run(&mut check_ctx)
        .await;
    (result, check_ctx.snapshot_class)
}

#[tokio::test]
async fn default_snapshot_class_is_preferred() {
    let ctx = TestContext::new().await;
    let driver = ctx.driver();
    let sc = format!("{}-sc", ctx.ns);
    create_storage_class(&ctx.client, &sc, &driver).await;
    create_snapshot_class(&ctx.client, &format!("{}-a", ctx.ns), &driver, false).await;
    create_snapshot_class(&ctx.client, &format!("{}-b", ctx.ns), &driver, true).await;
    create_snapshot_class(&ctx.client, &format!("{}-c", ctx.ns), &driver, false).await;
    create_snapshot_class(&ctx.client, &format!("{}-other", ctx.ns), "other.csi.example.com", true)
        .await;

    let (result, chosen) = resolve(&ctx, &options(&sc, None)).await;
    assert_eq!(result.unwrap(), Outcome::Passed);
    assert_eq!(chosen, Some(format!("{}-b", ctx.ns)));
}

#[tokio::test]
async fn last_matching_class_wins_without_default() {
    let ctx = TestContext::new().await;
    let driver = ctx.driver();
    let sc = format!("{}-sc", ctx.ns);
    create_storage_class(&ctx.client, &sc, &driver).await;
    create_snapshot_class(&ctx.client, &format!("{}-a", ctx.ns), &driver, false).await;
    create_snapshot_class(&ctx.client, &format!("{}-b", ctx.ns), &driver, false).await;

    let (result, chosen) = resolve(&ctx, &options(&sc, None)).await;
    assert_eq!(result.unwrap(), Outcome::Passed);
    // The API server lists cluster-scoped objects ordered by name.
    assert_eq!(chosen, Some(format!("{}-b", ctx.ns)));
}

#[tokio::test]
async fn no_matching_driver_fails() {
    let ctx = TestContext::new().await;
    let sc = format!("{}-sc", ctx.ns);
    create_storage_class(&ctx.client, &sc, &ctx.driver()).await;

    let (result, chosen) = resolve(&ctx, &options(&sc, None)).await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("no volume snapshot class"), "{err}");
    assert!(chosen.is_none());
}

#[tokio::test]
async fn explicit_class_is_checked_against_driver() {
    let ctx = TestContext::new().await;
    let sc = format!("{}-sc", ctx.ns);
    let good = format!("{}-good", ctx.ns);
    let wrong = format!("{}-wrong", ctx.ns);
    create_storage_class(&ctx.client, &sc, &ctx.driver()).await;
    create_snapshot_class(&ctx.client, &good, &ctx.driver(), false).await;
    create_snapshot_class(&ctx.client, &wrong, "other.csi.example.com", false).await;

    let (result, chosen) = resolve(&ctx, &options(&sc, Some(&good))).await;
    assert_eq!(result.unwrap(), Outcome::Passed);
    assert_eq!(chosen, Some(good));

    let (result, chosen) = resolve(&ctx, &options(&sc, Some(&wrong))).await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("does not match"), "{err}");
    assert!(chosen.is_none());
}

#[tokio::test]
async fn missing_explicit_class_fails() {
    let ctx = TestContext::new().await;
    let sc = format!("{}-sc", ctx.ns);
    create_storage_class(&ctx.client, &sc, &ctx.driver()).await;

    let (result, _) = resolve(&ctx, &options(&sc, Some("no-such-class"))).await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("no-such-class"), "{err}");
    assert!(err.contains("not found"), "{err}");
}

#[tokio::test]
async fn missing_storage_class_fails() {
    let ctx = TestContext::new().await;
    let (result, _) = resolve(&ctx, &options(&format!("{}-absent", ctx.ns), None)).await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("not found storageclass"), "{err}");
}

#[tokio::test]
async fn read_only_cluster_checks_pass() {
    let ctx = TestContext::new().await;
    let options = options("unused", None);
    let mut check_ctx = CheckContext::new(&ctx.cluster, &options, "abcdef");
    for id in [
        CheckId::ClusterAccess,
        CheckId::KubernetesVersion,
        CheckId::Rbac,
        CheckId::CsiApis,
        CheckId::NamespacePermissions,
    ] {
        let outcome = check_for(id).run(&mut check_ctx).await;
        assert!(
            matches!(outcome, Ok(Outcome::Passed)),
            "{id} did not pass: {outcome:?}"
        );
    }
}
