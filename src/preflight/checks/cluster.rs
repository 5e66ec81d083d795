use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::SelfSubjectAccessReview;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use tracing::{info, warn};

use crate::cluster::SNAPSHOT_GROUP;
use crate::error::{Error, Result};
use crate::helpers::{check_mark, meets_min_version};
use crate::preflight::catalog::Outcome;
use crate::preflight::CheckContext;
use crate::resources::namespace_access_review;

use super::Check;

pub const MIN_K8S_VERSION: &str = "1.19.0";

const DEFAULT_NAMESPACE: &str = "default";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
const RBAC_VERSION: &str = "v1";

const SNAPSHOT_CRD_PLURALS: [&str; 3] = [
    "volumesnapshotclasses",
    "volumesnapshotcontents",
    "volumesnapshots",
];

/// Can the caller read the `default` namespace?
pub struct ClusterAccess;

#[async_trait]
impl Check for ClusterAccess {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        let namespaces: Api<Namespace> = Api::all(ctx.cluster.client.clone());
        match namespaces.get(DEFAULT_NAMESPACE).await {
            Ok(_) => Ok(Outcome::Passed),
            Err(kube::Error::Api(resp)) => {
                let detail = resp.message.clone();
                let msg = match resp.code {
                    404 => format!("namespace '{DEFAULT_NAMESPACE}' not found :: {detail}"),
                    403 => format!(
                        "forbidden: unable to access namespace '{DEFAULT_NAMESPACE}' :: {detail}"
                    ),
                    401 => format!(
                        "unauthorized: unable to access namespace '{DEFAULT_NAMESPACE}' :: {detail}"
                    ),
                    _ => format!("unable to access default namespace of cluster :: {detail}"),
                };
                info!("Action Item: Provide service account OR kubeconfig file user with privilege to access namespace resource.");
                Err(Error::check(msg))
            }
            Err(e) => Err(Error::check(format!(
                "unable to access default namespace of cluster :: {e}"
            ))),
        }
    }
}

/// API server at least [`MIN_K8S_VERSION`].
pub struct KubernetesVersion;

#[async_trait]
impl Check for KubernetesVersion {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        let version = ctx.cluster.server_version().await?;
        if !meets_min_version(&version, MIN_K8S_VERSION)? {
            return Err(Error::check(format!(
                "kubernetes server version {version} is below the minimum required version {MIN_K8S_VERSION}"
            )));
        }
        info!(version = %version, "{} Kubernetes server version meets the minimum", check_mark());
        Ok(Outcome::Passed)
    }
}

/// May the caller create and delete namespaces? Asked through
/// SelfSubjectAccessReviews; nothing is actually created.
pub struct NamespacePermissions;

#[async_trait]
impl Check for NamespacePermissions {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        let reviews: Api<SelfSubjectAccessReview> = Api::all(ctx.cluster.client.clone());
        for verb in ["create", "delete"] {
            let review = reviews
                .create(&PostParams::default(), &namespace_access_review(verb))
                .await
                .map_err(|e| {
                    Error::check(format!("{verb} namespace permission check failed :: {e}"))
                })?;
            let status = review.status.unwrap_or_default();
            if !status.allowed {
                return Err(Error::check(format!(
                    "{verb} namespace not allowed: {}",
                    status.reason.unwrap_or_default()
                )));
            }
            info!(verb, "{} Allowed to {verb} namespaces", check_mark());
        }
        Ok(Outcome::Passed)
    }
}

/// `rbac.authorization.k8s.io/v1` is served.
pub struct Rbac;

#[async_trait]
impl Check for Rbac {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        if !ctx.cluster.has_group_version(RBAC_GROUP, RBAC_VERSION).await? {
            return Err(Error::check("not enabled kubernetes RBAC"));
        }
        info!("{} Kubernetes RBAC is enabled", check_mark());
        Ok(Outcome::Passed)
    }
}

/// The three snapshot CRDs exist. Nothing is installed when they are missing.
pub struct CsiApis;

#[async_trait]
impl Check for CsiApis {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        let crds: Api<CustomResourceDefinition> = Api::all(ctx.cluster.client.clone());
        let mut missing = Vec::new();
        for plural in SNAPSHOT_CRD_PLURALS {
            let name = format!("{plural}.{SNAPSHOT_GROUP}");
            match crds.get_opt(&name).await? {
                Some(_) => info!(crd = %name, "{} Volume snapshot CRD found", check_mark()),
                None => {
                    warn!(crd = %name, "Volume snapshot CRD not found on cluster");
                    missing.push(name);
                }
            }
        }
        if !missing.is_empty() {
            return Err(Error::check(format!(
                "volume snapshot CRDs not found on cluster: {}. ACTION REQUIRED: install the VolumeSnapshotClass, VolumeSnapshotContent and VolumeSnapshot CRDs",
                missing.join(", ")
            )));
        }
        Ok(Outcome::Passed)
    }
}
