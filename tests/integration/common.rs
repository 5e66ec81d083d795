//! Shared test harness and helpers for envtest-based integration tests.
//!
//! A single envtest server is shared across all tests in this binary. Each
//! test gets its own Kubernetes namespace for isolation, so tests can run in
//! parallel. Cluster-scoped objects (StorageClasses, VolumeSnapshotClasses)
//! are named after the test namespace for the same reason.
//!
//! There is no kubelet, scheduler or snapshot controller in envtest: pods
//! never become Ready and snapshots never become readyToUse unless a test
//! starts a [`FakeKubelet`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use envtest::Environment;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod, ServiceAccount};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config, ResourceExt};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use tvk_preflight::cluster::{
    snapshot_api_resource_at, ClusterContext, VOLUME_SNAPSHOT_CLASS_KIND, VOLUME_SNAPSHOT_KIND,
};
use tvk_preflight::exec::{ExecOptions, ExecResponse, RemoteExecutor};
use tvk_preflight::helpers::label_selector;
use tvk_preflight::wait::Backoff;

pub const TIMEOUT: Duration = Duration::from_secs(30);
pub const POLL: Duration = Duration::from_millis(500);

/// Counter for generating unique namespace names.
static NS_COUNTER: AtomicU32 = AtomicU32::new(0);

// ═══════════════════════════════════════════════════════════════════════════════
// Shared environment (one envtest server per test binary)
// ═══════════════════════════════════════════════════════════════════════════════

/// Holds the envtest server, a kube Client, and the tokio runtime that owns
/// the client's connections. All three live for the entire process.
struct SharedEnv {
    client: Client,
    _runtime: tokio::runtime::Runtime,
    _server: envtest::Server,
}

// SAFETY: envtest::Server is just a String wrapper (kubeconfig), so Send+Sync.
unsafe impl Send for SharedEnv {}
unsafe impl Sync for SharedEnv {}

static SHARED: OnceLock<SharedEnv> = OnceLock::new();

/// Minimal snapshot.storage.k8s.io CRD: schemaless, `v1` only.
fn snapshot_crd(kind: &str, plural: &str, scope: &str, status: bool) -> CustomResourceDefinition {
    let mut version = json!({
        "name": "v1",
        "served": true,
        "storage": true,
        "schema": {
            "openAPIV3Schema": {
                "type": "object",
                "x-kubernetes-preserve-unknown-fields": true
            }
        }
    });
    if status {
        version["subresources"] = json!({ "status": {} });
    }
    serde_json::from_value(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {
            "name": format!("{plural}.snapshot.storage.k8s.io"),
            "annotations": {
                "api-approved.kubernetes.io": "https://github.com/kubernetes-csi/external-snapshotter/pull/419"
            }
        },
        "spec": {
            "group": "snapshot.storage.k8s.io",
            "scope": scope,
            "names": {
                "kind": kind,
                "listKind": format!("{kind}List"),
                "plural": plural,
                "singular": kind.to_lowercase()
            },
            "versions": [version]
        }
    }))
    .expect("invalid snapshot CRD")
}

fn init_shared() -> SharedEnv {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn,tvk_preflight=debug"))
        .try_init();

    // Build a multi-threaded runtime that outlives every `#[tokio::test]`.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build shared runtime");

    let (client, server) = rt.block_on(async {
        let mut env = Environment::default();
        let env = env
            .with_crds(vec![
                snapshot_crd(VOLUME_SNAPSHOT_CLASS_KIND, "volumesnapshotclasses", "Cluster", false),
                snapshot_crd("VolumeSnapshotContent", "volumesnapshotcontents", "Cluster", true),
                snapshot_crd(VOLUME_SNAPSHOT_KIND, "volumesnapshots", "Namespaced", true),
            ])
            .expect("failed to configure CRDs");

        let server = env.create().expect("failed to start envtest server");
        let kubeconfig = server.kubeconfig().expect("failed to get kubeconfig");
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .expect("failed to build config");
        let client = Client::try_from(config).expect("failed to create client");
        (client, server)
    });

    SharedEnv {
        client,
        _runtime: rt,
        _server: server,
    }
}

/// Get (or create) the shared envtest environment.
///
/// Initialization runs on a dedicated OS thread to avoid the "cannot start a
/// runtime from within a runtime" panic that would occur if `block_on` were
/// called from inside a `#[tokio::test]` context.
fn shared() -> &'static SharedEnv {
    SHARED.get_or_init(|| {
        std::thread::spawn(init_shared)
            .join()
            .expect("shared env init thread panicked")
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-test context
// ═══════════════════════════════════════════════════════════════════════════════

/// envtest has no kubelet, so there is nothing to exec into.
pub struct NoExec;

#[async_trait]
impl RemoteExecutor for NoExec {
    async fn exec(&self, options: &ExecOptions) -> ExecResponse {
        ExecResponse::failed(format!("no kubelet to exec into pod {}", options.pod_name))
    }
}

/// Answers every exec with the same stdout and records the pods it was
/// asked to run in.
pub struct ScriptedExec {
    stdout: String,
    pods: Mutex<Vec<String>>,
}

impl ScriptedExec {
    pub fn new(stdout: &str) -> Arc<Self> {
        Arc::new(Self {
            stdout: stdout.to_string(),
            pods: Mutex::new(Vec::new()),
        })
    }

    pub fn pods(&self) -> Vec<String> {
        self.pods.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExec {
    async fn exec(&self, options: &ExecOptions) -> ExecResponse {
        self.pods.lock().unwrap().push(options.pod_name.clone());
        ExecResponse {
            stdout: self.stdout.clone(),
            ..Default::default()
        }
    }
}

/// An exec call that never returns.
pub struct HangingExec;

#[async_trait]
impl RemoteExecutor for HangingExec {
    async fn exec(&self, _options: &ExecOptions) -> ExecResponse {
        futures::future::pending().await
    }
}

/// Per-test context: owns a unique namespace and a cluster handle.
pub struct TestContext {
    pub client: Client,
    pub cluster: ClusterContext,
    pub ns: String,
}

impl TestContext {
    pub async fn new() -> Self {
        let client = shared().client.clone();

        let id = NS_COUNTER.fetch_add(1, Ordering::SeqCst);
        let ns = format!("test-{id}");

        let ns_api: Api<Namespace> = Api::all(client.clone());
        let ns_obj: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": &ns }
        }))
        .unwrap();
        ns_api
            .create(&PostParams::default(), &ns_obj)
            .await
            .expect("failed to create test namespace");

        // No controller-manager, so the default service account must be made
        // by hand before pods can be admitted.
        let sa_api: Api<ServiceAccount> = Api::namespaced(client.clone(), &ns);
        let sa: ServiceAccount = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": { "name": "default", "namespace": &ns }
        }))
        .unwrap();
        let _ = sa_api.create(&PostParams::default(), &sa).await;

        let cluster = ClusterContext::new(client.clone(), Arc::new(NoExec));
        Self {
            client,
            cluster,
            ns,
        }
    }

    /// CSI driver name unique to this test.
    pub fn driver(&self) -> String {
        format!("{}.csi.example.com", self.ns)
    }

    /// Cluster handle that execs through `executor`.
    pub fn cluster_with(&self, executor: Arc<dyn RemoteExecutor>) -> ClusterContext {
        ClusterContext::new(self.client.clone(), executor)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fake kubelet
// ═══════════════════════════════════════════════════════════════════════════════

/// Marks every labelled pod in a namespace Ready and every labelled
/// VolumeSnapshot readyToUse, until dropped.
pub struct FakeKubelet(tokio::task::JoinHandle<()>);

impl FakeKubelet {
    pub fn start(client: &Client, ns: &str) -> Self {
        let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
        let ar = snapshot_api_resource_at(VOLUME_SNAPSHOT_KIND, "v1");
        let snapshots: Api<DynamicObject> = Api::namespaced_with(client.clone(), ns, &ar);
        let params = ListParams::default().labels(&label_selector(None));
        let ready = json!({ "status": { "conditions": [{ "type": "Ready", "status": "True" }] } });
        let ready_to_use = json!({ "status": { "readyToUse": true } });

        Self(tokio::spawn(async move {
            loop {
                if let Ok(list) = pods.list(&params).await {
                    for pod in list.items {
                        if pod.metadata.deletion_timestamp.is_some() {
                            continue;
                        }
                        let _ = pods
                            .patch_status(&pod.name_any(), &PatchParams::default(), &Patch::Merge(&ready))
                            .await;
                    }
                }
                if let Ok(list) = snapshots.list(&params).await {
                    for snapshot in list.items {
                        let _ = snapshots
                            .patch_status(
                                &snapshot.name_any(),
                                &PatchParams::default(),
                                &Patch::Merge(&ready_to_use),
                            )
                            .await;
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }))
    }
}

impl Drop for FakeKubelet {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// A backoff that gives up almost immediately.
pub fn fast_backoff() -> Backoff {
    Backoff {
        steps: 2,
        duration: Duration::from_millis(50),
        factor: 1.0,
        jitter: 0.0,
    }
}

/// Long enough for a [`FakeKubelet`] to catch up.
pub fn kubelet_backoff() -> Backoff {
    Backoff {
        steps: 100,
        duration: Duration::from_millis(100),
        factor: 1.0,
        jitter: 0.0,
    }
}

/// Names of the VolumeSnapshots in `ns` labelled for `uid`.
pub async fn labelled_snapshots(client: &Client, ns: &str, uid: Option<&str>) -> Vec<String> {
    let ar = snapshot_api_resource_at(VOLUME_SNAPSHOT_KIND, "v1");
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), ns, &ar);
    let params = ListParams::default().labels(&label_selector(uid));
    let mut names: Vec<String> = api
        .list(&params)
        .await
        .expect("failed to list volume snapshots")
        .items
        .into_iter()
        .filter_map(|s| s.metadata.name)
        .collect();
    names.sort();
    names
}

/// Poll until a condition is true, or timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

pub async fn create_storage_class(client: &Client, name: &str, provisioner: &str) {
    let api: Api<StorageClass> = Api::all(client.clone());
    let sc: StorageClass = serde_json::from_value(json!({
        "apiVersion": "storage.k8s.io/v1",
        "kind": "StorageClass",
        "metadata": { "name": name },
        "provisioner": provisioner
    }))
    .unwrap();
    api.create(&PostParams::default(), &sc)
        .await
        .expect("failed to create StorageClass");
}

pub async fn create_snapshot_class(client: &Client, name: &str, driver: &str, default: bool) {
    let ar = snapshot_api_resource_at(VOLUME_SNAPSHOT_CLASS_KIND, "v1");
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
    let mut class = DynamicObject::new(name, &ar);
    if default {
        class.metadata.annotations = Some(
            [(
                "snapshot.storage.kubernetes.io/is-default-class".to_string(),
                "true".to_string(),
            )]
            .into(),
        );
    }
    class.data = json!({ "driver": driver, "deletionPolicy": "Delete" });
    api.create(&PostParams::default(), &class)
        .await
        .expect("failed to create VolumeSnapshotClass");
}

/// Names of the pods in `ns` carrying the preflight labels for `uid`.
pub async fn labelled_pods(client: &Client, ns: &str, uid: Option<&str>) -> Vec<String> {
    let api: Api<Pod> = Api::namespaced(client.clone(), ns);
    let params = ListParams::default().labels(&label_selector(uid));
    api.list(&params)
        .await
        .expect("failed to list pods")
        .items
        .into_iter()
        .filter_map(|p| p.metadata.name)
        .collect()
}

/// Names of the PVCs in `ns` carrying the preflight labels for `uid`.
pub async fn labelled_pvcs(client: &Client, ns: &str, uid: Option<&str>) -> Vec<String> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), ns);
    let params = ListParams::default().labels(&label_selector(uid));
    api.list(&params)
        .await
        .expect("failed to list pvcs")
        .items
        .into_iter()
        .filter_map(|p| p.metadata.name)
        .collect()
}

/// Wait until no pod or PVC labelled for `uid` is left in `ns`.
pub async fn wait_for_no_labelled(client: &Client, ns: &str, uid: Option<&str>) -> bool {
    wait_for(TIMEOUT, POLL, || async move {
        labelled_pods(client, ns, uid).await.is_empty()
            && labelled_pvcs(client, ns, uid).await.is_empty()
    })
    .await
}
