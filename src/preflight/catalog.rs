//! The ordered list of preflight checks and the loop that drives it.
//!
//! Gating is data: a [`CatalogEntry`] lists the checks that must have passed
//! before it may run. The loop never stops early; a gated entry whose gate
//! did not pass is recorded as skipped without being invoked.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::helpers::{check_mark, cross_mark};

/// Identifies one check in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckId {
    Kubectl,
    ClusterAccess,
    Helm,
    KubernetesVersion,
    Rbac,
    StorageSnapshotClass,
    CsiApis,
    PodCapability,
    DnsResolution,
    NamespacePermissions,
    VolumeSnapshotRestore,
}

impl CheckId {
    /// Human-readable name used in log lines.
    pub fn name(self) -> &'static str {
        CATALOG
            .iter()
            .find(|e| e.id == self)
            .map(|e| e.name)
            .unwrap_or("unknown check")
    }
}

impl std::fmt::Display for CheckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One row of the catalog.
#[derive(Clone, Copy, Debug)]
pub struct CatalogEntry {
    pub id: CheckId,
    pub name: &'static str,
    /// Checks that must have passed for this one to run.
    pub gated_by: &'static [CheckId],
}

/// Checks in execution order.
pub static CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        id: CheckId::Kubectl,
        name: "kubectl utility",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::ClusterAccess,
        name: "kubectl access",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::Helm,
        name: "helm version",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::KubernetesVersion,
        name: "kubernetes version",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::Rbac,
        name: "kubernetes RBAC",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::StorageSnapshotClass,
        name: "SnapshotClass",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::CsiApis,
        name: "VolumeSnapshot CRDs",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::PodCapability,
        name: "pod capability",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::DnsResolution,
        name: "DNS resolution",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::NamespacePermissions,
        name: "namespace permissions",
        gated_by: &[],
    },
    CatalogEntry {
        id: CheckId::VolumeSnapshotRestore,
        name: "volume snapshot and restore",
        gated_by: &[CheckId::StorageSnapshotClass],
    },
];

/// What a check reports when it did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    /// Not applicable on this cluster or run; the reason is logged.
    Skipped(String),
}

/// Terminal state of a check. Everything starts as `NotRun`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CheckStatus {
    #[default]
    NotRun,
    Passed,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub id: CheckId,
    pub name: &'static str,
    pub status: CheckStatus,
    /// Failure detail, or the skip reason.
    pub error: Option<String>,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }
}

/// Executes a single check by id. The orchestrator's runner talks to the
/// cluster; tests substitute their own.
#[async_trait]
pub trait CheckRunner: Send {
    async fn run_check(&mut self, id: CheckId) -> Result<Outcome>;
}

/// Run every catalog entry in order and collect the results.
pub async fn run_catalog<R: CheckRunner + ?Sized>(runner: &mut R) -> Vec<CheckResult> {
    let mut results: Vec<CheckResult> = Vec::with_capacity(CATALOG.len());

    for entry in CATALOG {
        let name = entry.name;

        let blocked_by = entry.gated_by.iter().find(|gate| {
            !results
                .iter()
                .any(|r| r.id == **gate && r.status == CheckStatus::Passed)
        });
        if let Some(gate) = blocked_by {
            let reason = format!("preflight check for {} did not pass", gate.name());
            warn!(check = name, "Skipping {name} check as {reason}");
            results.push(CheckResult {
                id: entry.id,
                name,
                status: CheckStatus::Skipped,
                error: Some(reason),
            });
            continue;
        }

        info!(check = name, "Checking {name}");
        let (status, detail) = match runner.run_check(entry.id).await {
            Ok(Outcome::Passed) => {
                info!(check = name, "{} Preflight check for {name} is successful", check_mark());
                (CheckStatus::Passed, None)
            }
            Ok(Outcome::Skipped(reason)) => {
                info!(check = name, "Skipping preflight check for {name} :: {reason}");
                (CheckStatus::Skipped, Some(reason))
            }
            Err(e) => {
                error!(check = name, "{} Preflight check for {name} failed :: {e}", cross_mark());
                (CheckStatus::Failed, Some(e.to_string()))
            }
        };
        results.push(CheckResult {
            id: entry.id,
            name,
            status,
            error: detail,
        });
    }

    results
}
