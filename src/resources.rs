//! Builders for everything a preflight run creates on the cluster.
//!
//! These are pure builders: no I/O happens here. Submitting the objects and
//! waiting on them lives in [`crate::provision`].

use std::collections::BTreeMap;

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, ExecAction, LocalObjectReference, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext,
    PodSpec, Probe, ResourceRequirements, SecurityContext, Toleration, TypedLocalObjectReference,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{ApiResource, DynamicObject, ObjectMeta};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cluster::{SNAPSHOT_GROUP, VOLUME_SNAPSHOT_KIND};
use crate::helpers::preflight_labels;

// ── Names ─────────────────────────────────────────────────────────────────────

pub const DNS_POD_PREFIX: &str = "dnsutils-";
pub const SOURCE_PVC_PREFIX: &str = "source-pvc-";
pub const SOURCE_POD_PREFIX: &str = "source-pod-";
pub const SOURCE_SNAPSHOT_PREFIX: &str = "snapshot-source-pvc-";
pub const RESTORE_PVC_PREFIX: &str = "restored-pvc-";
pub const RESTORE_POD_PREFIX: &str = "restored-pod-";
pub const UNMOUNTED_SNAPSHOT_PREFIX: &str = "unmounted-source-pvc-";
pub const UNMOUNTED_RESTORE_PVC_PREFIX: &str = "unmounted-restored-pvc-";
pub const UNMOUNTED_RESTORE_POD_PREFIX: &str = "unmounted-restored-pod-";
pub const CAPABILITY_POD_PREFIX: &str = "pod-capability-";

pub fn resource_name(prefix: &str, uid: &str) -> String {
    format!("{prefix}{uid}")
}

// ── Images and pod contents ───────────────────────────────────────────────────

pub const BUSYBOX_REGISTRY: &str = "quay.io/triliodata";
pub const BUSYBOX_IMAGE: &str = "busybox";
pub const BUSYBOX_CONTAINER: &str = "busybox";
pub const DNSUTILS_REGISTRY: &str = "gcr.io/kubernetes-e2e-test-images";
pub const DNSUTILS_IMAGE: &str = "dnsutils:1.3";
pub const DNSUTILS_CONTAINER: &str = "dnsutils";

pub const VOLUME_NAME: &str = "source-data";
pub const MOUNT_PATH: &str = "/demo/data";
pub const DATA_FILE_PATH: &str = "/demo/data/sample-file.txt";
pub const DATA_FILE_CONTENT: &str = "pod preflight data";

pub const DEFAULT_PVC_STORAGE_REQUEST: &str = "1Gi";

const SOURCE_READINESS_DELAY_SECONDS: i32 = 30;

pub fn busybox_image(local_registry: Option<&str>) -> String {
    format!(
        "{}/{BUSYBOX_IMAGE}",
        local_registry.unwrap_or(BUSYBOX_REGISTRY)
    )
}

pub fn dnsutils_image(local_registry: Option<&str>) -> String {
    format!(
        "{}/{DNSUTILS_IMAGE}",
        local_registry.unwrap_or(DNSUTILS_REGISTRY)
    )
}

pub fn sleep_command() -> Vec<String> {
    vec!["sleep".into(), "3600".into()]
}

/// Shell snippet the source pod runs: write the marker file, flush it, idle.
pub fn write_data_args() -> Vec<String> {
    vec![format!(
        "echo '{DATA_FILE_CONTENT}' > {DATA_FILE_PATH} && sync {DATA_FILE_PATH} && sleep 3000"
    )]
}

/// Prints the marker file and exits non-zero unless it holds the marker.
pub fn data_check_command() -> Vec<String> {
    vec![
        "/bin/sh".into(),
        "-c".into(),
        format!(
            "dat=$(cat \"{DATA_FILE_PATH}\"); echo \"${{dat}}\"; if [[ \"${{dat}}\" == \"{DATA_FILE_CONTENT}\" ]]; then exit 0; else exit 1; fi"
        ),
    ]
}

pub fn dns_lookup_command() -> Vec<String> {
    vec!["nslookup".into(), "kubernetes.default".into()]
}

// ── Per-run overrides ─────────────────────────────────────────────────────────

/// Where pods may be scheduled.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodScheduling {
    pub node_selector: Option<BTreeMap<String, String>>,
    pub affinity: Option<Affinity>,
    pub tolerations: Option<Vec<Toleration>>,
}

/// Caller-supplied knobs shared by every object of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionSpec {
    pub namespace: String,
    pub storage_class: String,
    pub local_registry: Option<String>,
    pub image_pull_secret: Option<String>,
    pub service_account: Option<String>,
    pub pvc_storage_request: String,
    pub resources: Option<ResourceRequirements>,
    pub scheduling: PodScheduling,
}

impl Default for ProvisionSpec {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            storage_class: String::new(),
            local_registry: None,
            image_pull_secret: None,
            service_account: None,
            pvc_storage_request: DEFAULT_PVC_STORAGE_REQUEST.into(),
            resources: None,
            scheduling: PodScheduling::default(),
        }
    }
}

impl ProvisionSpec {
    fn registry(&self) -> Option<&str> {
        self.local_registry.as_deref().filter(|r| !r.is_empty())
    }

    fn metadata(&self, name: &str, uid: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(preflight_labels(Some(uid))),
            ..Default::default()
        }
    }

    fn pvc_spec(&self) -> PersistentVolumeClaimSpec {
        PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(self.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(self.pvc_storage_request.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

// ── Pod builder ───────────────────────────────────────────────────────────────

/// Builder for the pods a run creates.
///
/// Every pod gets the run's labels, service account, pull secret and
/// scheduling options; callers add the container and, optionally, the data
/// volume.
pub struct PreflightPodBuilder<'a> {
    spec: &'a ProvisionSpec,
    name: String,
    uid: String,
    container: Option<Container>,
    claim: Option<String>,
    security_context: Option<PodSecurityContext>,
}

impl<'a> PreflightPodBuilder<'a> {
    pub fn new(spec: &'a ProvisionSpec, name: impl Into<String>, uid: &str) -> Self {
        Self {
            spec,
            name: name.into(),
            uid: uid.to_string(),
            container: None,
            claim: None,
            security_context: None,
        }
    }

    pub fn container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    /// Mount `claim` at [`MOUNT_PATH`] in the pod's container.
    pub fn data_volume(mut self, claim: impl Into<String>) -> Self {
        self.claim = Some(claim.into());
        self
    }

    pub fn security_context(mut self, security_context: PodSecurityContext) -> Self {
        self.security_context = Some(security_context);
        self
    }

    pub fn build(self) -> Pod {
        let mut containers: Vec<Container> = self.container.into_iter().collect();
        let volumes = self.claim.map(|claim| {
            for c in containers.iter_mut() {
                c.volume_mounts = Some(vec![VolumeMount {
                    name: VOLUME_NAME.to_string(),
                    mount_path: MOUNT_PATH.to_string(),
                    ..Default::default()
                }]);
            }
            vec![Volume {
                name: VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim,
                    read_only: Some(false),
                }),
                ..Default::default()
            }]
        });

        let scheduling = &self.spec.scheduling;
        Pod {
            metadata: self.spec.metadata(&self.name, &self.uid),
            spec: Some(PodSpec {
                service_account_name: self.spec.service_account.clone(),
                image_pull_secrets: self
                    .spec
                    .image_pull_secret
                    .as_ref()
                    .filter(|s| !s.is_empty())
                    .map(|name| vec![LocalObjectReference { name: name.clone() }]),
                node_selector: scheduling.node_selector.clone(),
                affinity: scheduling.affinity.clone(),
                tolerations: scheduling.tolerations.clone(),
                security_context: self.security_context,
                containers,
                volumes,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

// ── Builders ──────────────────────────────────────────────────────────────────

/// Pod running `dnsutils` idle, used to exec `nslookup`.
pub fn dns_pod(spec: &ProvisionSpec, uid: &str) -> Pod {
    PreflightPodBuilder::new(spec, resource_name(DNS_POD_PREFIX, uid), uid)
        .container(Container {
            name: DNSUTILS_CONTAINER.to_string(),
            image: Some(dnsutils_image(spec.registry())),
            command: Some(sleep_command()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            resources: spec.resources.clone(),
            ..Default::default()
        })
        .build()
}

/// PVC on the caller's storage class that the source pod writes into.
pub fn source_pvc(spec: &ProvisionSpec, uid: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: spec.metadata(&resource_name(SOURCE_PVC_PREFIX, uid), uid),
        spec: Some(spec.pvc_spec()),
        ..Default::default()
    }
}

/// Pod that writes the marker file into `pvc_name`. Only turns Ready once
/// the file holds the marker.
pub fn source_pod(spec: &ProvisionSpec, pvc_name: &str, uid: &str) -> Pod {
    PreflightPodBuilder::new(spec, resource_name(SOURCE_POD_PREFIX, uid), uid)
        .container(Container {
            name: BUSYBOX_CONTAINER.to_string(),
            image: Some(busybox_image(spec.registry())),
            command: Some(vec!["bin/sh".into(), "-c".into()]),
            args: Some(write_data_args()),
            resources: spec.resources.clone(),
            readiness_probe: Some(Probe {
                initial_delay_seconds: Some(SOURCE_READINESS_DELAY_SECONDS),
                exec: Some(ExecAction {
                    command: Some(data_check_command()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .data_volume(pvc_name)
        .build()
}

/// VolumeSnapshot of `pvc_name` using `snapshot_class`.
pub fn volume_snapshot(
    ar: &ApiResource,
    spec: &ProvisionSpec,
    name: &str,
    snapshot_class: &str,
    pvc_name: &str,
    uid: &str,
) -> DynamicObject {
    let mut snapshot = DynamicObject::new(name, ar).within(&spec.namespace);
    snapshot.metadata.labels = Some(preflight_labels(Some(uid)));
    snapshot.data = json!({
        "spec": {
            "volumeSnapshotClassName": snapshot_class,
            "source": { "persistentVolumeClaimName": pvc_name },
        }
    });
    snapshot
}

/// PVC restored from the VolumeSnapshot `snapshot_name`.
pub fn restore_pvc(
    spec: &ProvisionSpec,
    name: &str,
    snapshot_name: &str,
    uid: &str,
) -> PersistentVolumeClaim {
    let mut pvc_spec = spec.pvc_spec();
    pvc_spec.data_source = Some(TypedLocalObjectReference {
        api_group: Some(SNAPSHOT_GROUP.to_string()),
        kind: VOLUME_SNAPSHOT_KIND.to_string(),
        name: snapshot_name.to_string(),
    });
    PersistentVolumeClaim {
        metadata: spec.metadata(name, uid),
        spec: Some(pvc_spec),
        ..Default::default()
    }
}

/// Idle busybox pod mounting a restored PVC, used to read the marker back.
pub fn restore_pod(spec: &ProvisionSpec, name: &str, pvc_name: &str, uid: &str) -> Pod {
    PreflightPodBuilder::new(spec, name, uid)
        .container(Container {
            name: BUSYBOX_CONTAINER.to_string(),
            image: Some(busybox_image(spec.registry())),
            command: Some(sleep_command()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            resources: spec.resources.clone(),
            ..Default::default()
        })
        .data_volume(pvc_name)
        .build()
}

// ── Pod capabilities ──────────────────────────────────────────────────────────

/// Linux capabilities every capability pod asks for.
pub const CAPABILITY_POD_ADDS: [&str; 9] = [
    "KILL",
    "AUDIT_WRITE",
    "NET_BIND_SERVICE",
    "CHOWN",
    "FOWNER",
    "DAC_OVERRIDE",
    "SETGID",
    "SETUID",
    "SYS_ADMIN",
];

/// Security settings one capability pod runs with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PodCapabilityCase {
    pub user_id: i64,
    pub allow_privilege_escalation: bool,
    pub privileged: bool,
}

/// Root and privileged, an unprivileged non-root user, and a non-root user
/// allowed to escalate.
pub const POD_CAPABILITY_CASES: [PodCapabilityCase; 3] = [
    PodCapabilityCase {
        user_id: 0,
        allow_privilege_escalation: true,
        privileged: true,
    },
    PodCapabilityCase {
        user_id: 1001,
        allow_privilege_escalation: false,
        privileged: false,
    },
    PodCapabilityCase {
        user_id: 101,
        allow_privilege_escalation: true,
        privileged: false,
    },
];

/// Idle busybox pod running with the settings of `case`. `index` keeps the
/// pod names of one run apart.
pub fn capability_pod(spec: &ProvisionSpec, index: usize, case: &PodCapabilityCase, uid: &str) -> Pod {
    let security_context = if case.user_id == 0 {
        PodSecurityContext {
            run_as_non_root: Some(false),
            ..Default::default()
        }
    } else {
        PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(case.user_id),
            ..Default::default()
        }
    };

    let name = resource_name(CAPABILITY_POD_PREFIX, &format!("{index}-{uid}"));
    PreflightPodBuilder::new(spec, name, uid)
        .container(Container {
            name: BUSYBOX_CONTAINER.to_string(),
            image: Some(busybox_image(spec.registry())),
            command: Some(sleep_command()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            resources: spec.resources.clone(),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(CAPABILITY_POD_ADDS.iter().map(|c| c.to_string()).collect()),
                    drop: None,
                }),
                allow_privilege_escalation: Some(case.allow_privilege_escalation),
                privileged: Some(case.privileged),
                read_only_root_filesystem: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        })
        .security_context(security_context)
        .build()
}

// ── Access reviews ────────────────────────────────────────────────────────────

/// Asks the API server whether the caller may `verb` namespaces.
pub fn namespace_access_review(verb: &str) -> SelfSubjectAccessReview {
    SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                verb: Some(verb.to_string()),
                group: Some(String::new()),
                version: Some("v1".to_string()),
                resource: Some("namespaces".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}
