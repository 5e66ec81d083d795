//! Optional YAML configuration file and how command-line flags layer on top
//! of it.
//!
//! ```yaml
//! kubeconfig: ~/.kube/config
//! logLevel: debug
//! run:
//!   storageClass: csi-standard
//!   namespace: preflight
//!   cleanupOnFailure: true
//! cleanup:
//!   namespace: preflight
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cleanup::CleanupOptions;
use crate::error::{Error, Result};
use crate::preflight::RunOptions;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub kubeconfig: Option<String>,
    pub log_level: Option<String>,
    pub run: Option<RunOptions>,
    pub cleanup: Option<CleanupOptions>,
}

impl ConfigFile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read config file {} :: {e}", path.display()))
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_yaml(&raw)
    }
}

/// `run` flags given on the command line. Set values replace the file's.
#[derive(Clone, Debug, Default)]
pub struct RunOverrides {
    pub storage_class: Option<String>,
    pub snapshot_class: Option<String>,
    pub local_registry: Option<String>,
    pub image_pull_secret: Option<String>,
    pub service_account: Option<String>,
    pub namespace: Option<String>,
    pub pvc_storage_request: Option<String>,
    pub cleanup_on_failure: bool,
    pub in_cluster: bool,
}

impl RunOverrides {
    pub fn apply(self, mut base: RunOptions) -> RunOptions {
        if let Some(v) = self.storage_class {
            base.storage_class = v;
        }
        if let Some(v) = self.namespace {
            base.namespace = v;
        }
        if let Some(v) = self.pvc_storage_request {
            base.pvc_storage_request = v;
        }
        base.snapshot_class = self.snapshot_class.or(base.snapshot_class);
        base.local_registry = self.local_registry.or(base.local_registry);
        base.image_pull_secret = self.image_pull_secret.or(base.image_pull_secret);
        base.service_account = self.service_account.or(base.service_account);
        base.cleanup_on_failure |= self.cleanup_on_failure;
        base.in_cluster |= self.in_cluster;
        base
    }
}

/// `cleanup` flags given on the command line.
#[derive(Clone, Debug, Default)]
pub struct CleanupOverrides {
    pub uid: Option<String>,
    pub namespace: Option<String>,
}

impl CleanupOverrides {
    pub fn apply(self, mut base: CleanupOptions) -> CleanupOptions {
        base.uid = self.uid.or(base.uid);
        if let Some(ns) = self.namespace {
            base.namespace = ns;
        }
        base
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// `--log-level` values, case-insensitive. Anything unknown means INFO.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Panic,
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PANIC" => Self::Panic,
            "FATAL" => Self::Fatal,
            "ERROR" => Self::Error,
            "WARN" | "WARNING" => Self::Warn,
            "DEBUG" => Self::Debug,
            "TRACE" => Self::Trace,
            _ => Self::Info,
        }
    }

    /// Directive for `tracing_subscriber::EnvFilter`. PANIC and FATAL have
    /// no tracing counterpart and map to `error`.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Panic | Self::Fatal | Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Filter directives for the subscriber.
///
/// `level` sets the default for every target. `extra` (usually `RUST_LOG`)
/// can only add per-target directives such as `kube=debug`; a bare level in
/// it is dropped so it never overrides `level`.
pub fn log_directives(level: LogLevel, extra: Option<&str>) -> String {
    let mut directives = vec![
        level.as_filter().to_string(),
        "kube=warn".to_string(),
        "hyper=warn".to_string(),
        "tower=warn".to_string(),
    ];
    directives.extend(
        extra
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|d| d.contains('=') || d.contains('['))
            .map(str::to_string),
    );
    directives.join(",")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(Error::config(format!(
                "unknown log format '{other}', expected 'text' or 'json'"
            ))),
        }
    }
}
