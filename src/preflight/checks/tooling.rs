use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::{Error, Result};
use crate::helpers::{check_mark, extract_version_from_string, meets_min_version};
use crate::preflight::catalog::Outcome;
use crate::preflight::CheckContext;

use super::Check;

pub const MIN_HELM_VERSION: &str = "3.0.0";

const KUBECTL_BINARY: &str = "kubectl";
const HELM_BINARY: &str = "helm";

const IN_CLUSTER_SKIP: &str = "in-cluster run, local tooling is not used";

fn find_binary(name: &str) -> Result<std::path::PathBuf> {
    let path = which::which(name).map_err(|e| {
        Error::check(format!(
            "error finding '{name}' binary in $PATH of the system :: {e}"
        ))
    })?;
    info!(binary = name, path = %path.display(), "{name} found at path");
    Ok(path)
}

pub struct Kubectl;

#[async_trait]
impl Check for Kubectl {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        if ctx.options.in_cluster {
            return Ok(Outcome::Skipped(IN_CLUSTER_SKIP.into()));
        }
        find_binary(KUBECTL_BINARY)?;
        Ok(Outcome::Passed)
    }
}

/// Helm present and at least [`MIN_HELM_VERSION`]. Not needed on OpenShift.
pub struct Helm;

async fn helm_version(binary: &std::path::Path) -> Result<String> {
    let output = Command::new(binary)
        .args(["version", "--template", "{{.Version}}"])
        .output()
        .await
        .map_err(|e| Error::check(format!("error running '{HELM_BINARY} version' :: {e}")))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::check(format!(
            "'{HELM_BINARY} version' exited with {} :: {}",
            output.status,
            stderr.trim()
        )));
    }
    extract_version_from_string(&stdout)
}

#[async_trait]
impl Check for Helm {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        if ctx.options.in_cluster {
            return Ok(Outcome::Skipped(IN_CLUSTER_SKIP.into()));
        }
        if ctx.cluster.is_openshift().await? {
            info!("{} Running an OpenShift cluster, helm is not needed", check_mark());
            return Ok(Outcome::Skipped(
                "helm check is not needed for OpenShift clusters".into(),
            ));
        }

        let path = find_binary(HELM_BINARY)?;
        let version = helm_version(&path).await?;
        if !meets_min_version(&version, MIN_HELM_VERSION)? {
            return Err(Error::check(format!(
                "helm {version} does not meet minimum version requirement. Upgrade helm to minimum version - {MIN_HELM_VERSION}"
            )));
        }
        info!(version = %version, "{} Helm version meets required version", check_mark());
        Ok(Outcome::Passed)
    }
}
