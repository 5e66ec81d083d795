//! Cluster access: client construction and API discovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kube::api::ApiResource;
use kube::core::GroupVersionKind;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exec::{KubeExecutor, RemoteExecutor};

pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
pub const VOLUME_SNAPSHOT_KIND: &str = "VolumeSnapshot";
pub const VOLUME_SNAPSHOT_CLASS_KIND: &str = "VolumeSnapshotClass";
pub const OPENSHIFT_GROUP: &str = "security.openshift.io";
pub const OPENSHIFT_VERSION: &str = "v1";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the client configuration comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KubeconfigSource {
    /// In-cluster service account, `$KUBECONFIG` or `~/.kube/config`.
    Infer,
    File(PathBuf),
}

impl KubeconfigSource {
    /// Decide which configuration to load for a `--kubeconfig` value.
    ///
    /// A path that does not exist is an error. An existing but empty file
    /// falls back to inference.
    pub fn resolve(path: Option<&str>) -> Result<Self> {
        let Some(raw) = path.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(Self::Infer);
        };
        let path = expand_home(raw)?;
        let meta = std::fs::metadata(&path).map_err(|e| {
            Error::config(format!("kubeconfig file {} is not accessible :: {e}", path.display()))
        })?;
        if meta.is_file() && meta.len() == 0 {
            warn!(path = %path.display(), "kubeconfig file is empty, falling back to default config");
            return Ok(Self::Infer);
        }
        Ok(Self::File(path))
    }

    async fn load(&self) -> Result<Config> {
        let mut config = match self {
            Self::Infer => Config::infer().await?,
            Self::File(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
        };
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);
        Ok(config)
    }
}

fn expand_home(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .ok_or_else(|| Error::config("cannot expand '~': home directory is unknown")),
        None => Ok(Path::new(raw).to_path_buf()),
    }
}

/// Everything a run needs to talk to the cluster. Built once and passed by
/// reference.
#[derive(Clone)]
pub struct ClusterContext {
    pub client: Client,
    pub executor: Arc<dyn RemoteExecutor>,
}

impl ClusterContext {
    pub fn new(client: Client, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { client, executor }
    }

    /// Build the client from `--kubeconfig` (or inference) and install the
    /// pod-exec backed executor.
    pub async fn init(kubeconfig: Option<&str>) -> Result<Self> {
        let source = KubeconfigSource::resolve(kubeconfig)?;
        debug!(?source, "loading cluster configuration");
        let config = source.load().await?;
        info!(cluster_url = %config.cluster_url, "connecting to cluster");
        let client = Client::try_from(config)?;
        let executor = Arc::new(KubeExecutor::new(client.clone()));
        Ok(Self::new(client, executor))
    }

    /// `gitVersion` of the API server, e.g. `v1.29.3+k3s1`.
    pub async fn server_version(&self) -> Result<String> {
        Ok(self.client.apiserver_version().await?.git_version)
    }

    /// Preferred version of an API group, `None` when the group is not served.
    pub async fn preferred_version_for_group(&self, group: &str) -> Result<Option<String>> {
        let groups = self.client.list_api_groups().await?;
        Ok(groups
            .groups
            .into_iter()
            .find(|g| g.name == group)
            .map(|g| match g.preferred_version {
                Some(v) => v.version,
                None => g.versions.first().map(|v| v.version.clone()).unwrap_or_default(),
            })
            .filter(|v| !v.is_empty()))
    }

    /// Every version served for `group`. Empty when the group is absent.
    pub async fn versions_of_group(&self, group: &str) -> Result<Vec<String>> {
        let groups = self.client.list_api_groups().await?;
        Ok(groups
            .groups
            .into_iter()
            .find(|g| g.name == group)
            .map(|g| g.versions.into_iter().map(|v| v.version).collect())
            .unwrap_or_default())
    }

    pub async fn has_group_version(&self, group: &str, version: &str) -> Result<bool> {
        Ok(self
            .versions_of_group(group)
            .await?
            .iter()
            .any(|v| v == version))
    }

    pub async fn is_openshift(&self) -> Result<bool> {
        self.has_group_version(OPENSHIFT_GROUP, OPENSHIFT_VERSION)
            .await
    }

    /// `ApiResource` for a snapshot.storage.k8s.io kind at the cluster's
    /// preferred version.
    pub async fn snapshot_api_resource(&self, kind: &str) -> Result<ApiResource> {
        let version = self
            .preferred_version_for_group(SNAPSHOT_GROUP)
            .await?
            .ok_or_else(|| {
                Error::not_found(format!("API group {SNAPSHOT_GROUP} is not served by the cluster"))
            })?;
        Ok(snapshot_api_resource_at(kind, &version))
    }
}

/// `ApiResource` for a snapshot kind at an explicit version.
pub fn snapshot_api_resource_at(kind: &str, version: &str) -> ApiResource {
    let lower = kind.to_lowercase();
    let plural = if lower.ends_with('s') {
        format!("{lower}es")
    } else {
        format!("{lower}s")
    };
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(SNAPSHOT_GROUP, version, kind), &plural)
}
