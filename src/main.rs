//! tvk-preflight: run preflight checks against a cluster, or clean up the
//! resources a previous run left behind.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use tvk_preflight::cleanup::Cleanup;
use tvk_preflight::cluster::ClusterContext;
use tvk_preflight::config::{
    log_directives, CleanupOverrides, ConfigFile, LogFormat, LogLevel, RunOverrides,
};
use tvk_preflight::helpers::cross_mark;
use tvk_preflight::preflight::Preflight;

#[derive(Parser, Debug)]
#[command(
    name = "tvk-preflight",
    about = "Preflight checks and cleanup for TrilioVault for Kubernetes"
)]
struct Cli {
    /// Path to a kubeconfig file. Without it the usual inference applies
    /// (in-cluster, $KUBECONFIG, ~/.kube/config).
    #[arg(long, global = true)]
    kubeconfig: Option<String>,

    /// PANIC, FATAL, ERROR, WARN, INFO, DEBUG or TRACE. Unknown values mean INFO.
    /// This is the default for every target; RUST_LOG may only add
    /// per-target directives on top of it.
    #[arg(long, global = true, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, global = true, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,

    /// YAML file with `run:` and `cleanup:` sections. Flags win over it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every preflight check once.
    Run(RunArgs),
    /// Delete resources created by preflight runs.
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// StorageClass to provision test volumes from.
    #[arg(long)]
    storage_class: Option<String>,

    /// VolumeSnapshotClass to use. Picked from the storage class driver when unset.
    #[arg(long)]
    volume_snapshot_class: Option<String>,

    /// Registry to pull the test images from instead of the public ones.
    #[arg(long)]
    local_registry: Option<String>,

    #[arg(long)]
    image_pull_secret: Option<String>,

    #[arg(long)]
    service_account: Option<String>,

    /// Clean up created resources even when some check failed.
    #[arg(long)]
    cleanup_on_failure: bool,

    #[arg(long)]
    namespace: Option<String>,

    /// Running inside the cluster: skip the kubectl and helm checks.
    #[arg(long)]
    in_cluster: bool,

    /// Size requested by every test PVC.
    #[arg(long)]
    pvc_storage_request: Option<String>,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    /// Run identity to clean. Every preflight run is cleaned when omitted.
    #[arg(long)]
    uid: Option<String>,

    #[arg(long)]
    namespace: Option<String>,
}

fn init_logging(level: LogLevel, format: LogFormat) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let env_filter = tracing_subscriber::EnvFilter::new(log_directives(level, rust_log.as_deref()));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(env_filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    let level = cli
        .log_level
        .as_deref()
        .or(file.log_level.as_deref())
        .map(LogLevel::parse_lenient)
        .unwrap_or_default();
    init_logging(level, cli.log_format.parse()?);

    let kubeconfig = cli.kubeconfig.or(file.kubeconfig);
    let cluster = ClusterContext::init(kubeconfig.as_deref()).await?;

    match cli.command {
        Command::Run(args) => {
            let options = RunOverrides {
                storage_class: args.storage_class,
                snapshot_class: args.volume_snapshot_class,
                local_registry: args.local_registry,
                image_pull_secret: args.image_pull_secret,
                service_account: args.service_account,
                namespace: args.namespace,
                pvc_storage_request: args.pvc_storage_request,
                cleanup_on_failure: args.cleanup_on_failure,
                in_cluster: args.in_cluster,
            }
            .apply(file.run.unwrap_or_default());

            let report = Preflight::new(&cluster, options).run().await?;
            info!(
                uid = %report.uid,
                succeeded = report.succeeded(),
                "preflight run finished"
            );
        }
        Command::Cleanup(args) => {
            let options = CleanupOverrides {
                uid: args.uid,
                namespace: args.namespace,
            }
            .apply(file.cleanup.unwrap_or_default());

            let cleanup = Cleanup::new(&cluster, &options.namespace);
            if let Err(e) = cleanup.cleanup_preflight_resources(options.uid.as_deref()).await {
                error!("{} Failed to cleanup preflight resources :: {e}", cross_mark());
                return Err(e.into());
            }
        }
    }

    Ok(())
}
