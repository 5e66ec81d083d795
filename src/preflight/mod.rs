//! Preflight orchestration: run the check catalog once against a cluster,
//! summarise, and clean up what the run created.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ResourceRequirements;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cleanup::Cleanup;
use crate::cluster::ClusterContext;
use crate::error::{Error, Result};
use crate::exec::EXEC_TIMEOUT;
use crate::helpers::{cross_mark, generate_run_uid, UidCharset};
use crate::provision::Provisioner;
use crate::resources::{PodScheduling, ProvisionSpec, DEFAULT_PVC_STORAGE_REQUEST};
use crate::wait::Backoff;

pub mod catalog;
pub mod checks;

pub use catalog::{
    run_catalog, CatalogEntry, CheckId, CheckResult, CheckRunner, CheckStatus, Outcome, CATALOG,
};
pub use checks::{check_for, Check};

// ── Options ───────────────────────────────────────────────────────────────────

/// Everything `run` accepts, from flags or the `run:` section of a config
/// file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    pub storage_class: String,
    pub snapshot_class: Option<String>,
    pub local_registry: Option<String>,
    pub image_pull_secret: Option<String>,
    pub service_account: Option<String>,
    pub cleanup_on_failure: bool,
    pub namespace: String,
    pub in_cluster: bool,
    pub pvc_storage_request: String,
    pub resources: Option<ResourceRequirements>,
    pub pod_scheduling: PodScheduling,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            storage_class: String::new(),
            snapshot_class: None,
            local_registry: None,
            image_pull_secret: None,
            service_account: None,
            cleanup_on_failure: false,
            namespace: "default".into(),
            in_cluster: false,
            pvc_storage_request: DEFAULT_PVC_STORAGE_REQUEST.into(),
            resources: None,
            pod_scheduling: PodScheduling::default(),
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.storage_class.trim().is_empty() {
            return Err(Error::config("storage class is required for a preflight run"));
        }
        if self.namespace.trim().is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        if self.pvc_storage_request.trim().is_empty() {
            return Err(Error::config("pvc storage request must not be empty"));
        }
        Ok(())
    }

    pub fn provision_spec(&self) -> ProvisionSpec {
        ProvisionSpec {
            namespace: self.namespace.clone(),
            storage_class: self.storage_class.clone(),
            local_registry: self.local_registry.clone(),
            image_pull_secret: self.image_pull_secret.clone(),
            service_account: self.service_account.clone(),
            pvc_storage_request: self.pvc_storage_request.clone(),
            resources: self.resources.clone(),
            scheduling: self.pod_scheduling.clone(),
        }
    }

    fn log(&self) {
        let show = |v: &Option<String>| v.clone().unwrap_or_default();
        info!("====PREFLIGHT RUN OPTIONS====");
        info!(namespace = %self.namespace, in_cluster = self.in_cluster, "NAMESPACE=\"{}\"", self.namespace);
        info!("STORAGE-CLASS=\"{}\"", self.storage_class);
        info!("VOLUME-SNAPSHOT-CLASS=\"{}\"", show(&self.snapshot_class));
        info!("LOCAL-REGISTRY=\"{}\"", show(&self.local_registry));
        info!("IMAGE-PULL-SECRET=\"{}\"", show(&self.image_pull_secret));
        info!("SERVICE-ACCOUNT=\"{}\"", show(&self.service_account));
        info!("CLEANUP-ON-FAILURE=\"{}\"", self.cleanup_on_failure);
        info!("PVC STORAGE REQUEST=\"{}\"", self.pvc_storage_request);
        if let Some(resources) = &self.resources {
            info!(?resources, "POD RESOURCES");
        }
        info!("====PREFLIGHT RUN OPTIONS END====");
    }
}

// ── Per-run state shared by the checks ────────────────────────────────────────

/// State one run threads through its checks.
pub struct CheckContext<'a> {
    pub cluster: &'a ClusterContext,
    pub options: &'a RunOptions,
    pub provision: ProvisionSpec,
    pub uid: String,
    pub backoff: Backoff,
    pub exec_timeout: Duration,
    /// Set by the SnapshotClass check, consumed by snapshot/restore.
    pub snapshot_class: Option<String>,
}

impl<'a> CheckContext<'a> {
    pub fn new(cluster: &'a ClusterContext, options: &'a RunOptions, uid: impl Into<String>) -> Self {
        Self {
            cluster,
            options,
            provision: options.provision_spec(),
            uid: uid.into(),
            backoff: Backoff::default_retry(),
            exec_timeout: EXEC_TIMEOUT,
            snapshot_class: None,
        }
    }

    pub fn provisioner(&self) -> Provisioner<'a> {
        Provisioner::new(self.cluster, self.provision.namespace.clone())
            .with_backoff(self.backoff.clone())
    }
}

/// Runs catalog entries against the live cluster.
struct ClusterRunner<'a> {
    ctx: CheckContext<'a>,
}

#[async_trait]
impl CheckRunner for ClusterRunner<'_> {
    async fn run_check(&mut self, id: CheckId) -> Result<Outcome> {
        check_for(id).run(&mut self.ctx).await
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreflightReport {
    pub uid: String,
    pub results: Vec<CheckResult>,
}

impl PreflightReport {
    /// No check failed. Skipped checks do not count against the run.
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|r| r.status != CheckStatus::Failed)
    }

    pub fn status_of(&self, id: CheckId) -> CheckStatus {
        self.results
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.results
            .iter()
            .filter(|r| r.status == CheckStatus::Failed)
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct Preflight<'a> {
    cluster: &'a ClusterContext,
    options: RunOptions,
    backoff: Backoff,
    uid_charset: UidCharset,
}

impl<'a> Preflight<'a> {
    pub fn new(cluster: &'a ClusterContext, options: RunOptions) -> Self {
        Self {
            cluster,
            options,
            backoff: Backoff::default_retry(),
            uid_charset: UidCharset::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_uid_charset(mut self, charset: UidCharset) -> Self {
        self.uid_charset = charset;
        self
    }

    /// Run every check, log the summary and clean up.
    ///
    /// Only setup problems (bad options, no run identity) are returned as
    /// errors. Check failures end up in the report; cleanup failures are
    /// logged.
    pub async fn run(&self) -> Result<PreflightReport> {
        self.options.validate()?;
        self.options.log();

        let uid = generate_run_uid(self.uid_charset).map_err(|e| {
            error!(error = %e, "Error generating resource name suffix");
            e
        })?;
        info!(uid = %uid, "Generated UID for preflight check - {uid}");

        let mut ctx = CheckContext::new(self.cluster, &self.options, uid.clone());
        ctx.backoff = self.backoff.clone();
        let mut runner = ClusterRunner { ctx };
        let results = run_catalog(&mut runner).await;
        let report = PreflightReport { uid, results };

        if report.succeeded() {
            info!("All preflight checks succeeded!");
        } else {
            let failed: Vec<&str> = report.failed().map(|r| r.name).collect();
            warn!(failed = ?failed, "Some preflight checks failed");
        }

        if report.succeeded() || self.options.cleanup_on_failure {
            let cleanup = Cleanup::new(self.cluster, &self.options.namespace);
            if let Err(e) = cleanup.cleanup_preflight_resources(Some(&report.uid)).await {
                error!("{} Failed to cleanup preflight resources :: {e}", cross_mark());
            }
        } else {
            info!(uid = %report.uid, "Leaving preflight resources in place, rerun cleanup with this uid to remove them");
        }

        Ok(report)
    }
}
