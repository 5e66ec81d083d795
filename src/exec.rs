//! Remote exec gateway.
//!
//! The exec call runs on its own task and reports back over a oneshot
//! channel. Callers race the receiver against a wall-clock timeout; when the
//! timer wins the task is left to finish (or hang) on its own and its result
//! is dropped. Nothing interrupts the underlying stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Hard limit on a single exec round trip.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// What to run, and where.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub command: Vec<String>,
}

impl ExecOptions {
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container_name: impl Into<String>,
        command: &[&str],
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container_name: container_name.into(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

/// Captured output of one exec call. `error` is set when the call itself
/// failed or the command exited unsuccessfully.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl ExecResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Something that can run a command inside a container.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn exec(&self, options: &ExecOptions) -> ExecResponse;
}

/// [`RemoteExecutor`] backed by the pod `exec` subresource.
#[derive(Clone)]
pub struct KubeExecutor {
    client: Client,
}

impl KubeExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "exec stream closed with error");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl RemoteExecutor for KubeExecutor {
    async fn exec(&self, options: &ExecOptions) -> ExecResponse {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &options.namespace);
        let params = AttachParams::default()
            .container(options.container_name.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);

        let mut attached = match pods
            .exec(&options.pod_name, options.command.clone(), &params)
            .await
        {
            Ok(attached) => attached,
            Err(e) => return ExecResponse::failed(e.to_string()),
        };

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();
        let (stdout, stderr) = futures::join!(read_all(stdout), read_all(stderr));

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        if let Err(e) = attached.join().await {
            debug!(error = %e, pod = %options.pod_name, "exec session did not close cleanly");
        }

        let error = match status {
            Some(s) if s.status.as_deref() != Some("Success") => Some(
                s.message
                    .unwrap_or_else(|| "command terminated with a non-zero exit code".to_string()),
            ),
            _ => None,
        };

        ExecResponse {
            stdout,
            stderr,
            error,
        }
    }
}

/// Start an exec call on a separate task and return the channel its result
/// arrives on.
///
/// An empty pod or container name is answered immediately with an argument
/// error; the executor is never called.
pub fn exec_in_container(
    executor: Arc<dyn RemoteExecutor>,
    options: ExecOptions,
) -> oneshot::Receiver<ExecResponse> {
    let (tx, rx) = oneshot::channel();

    if options.pod_name.is_empty() || options.container_name.is_empty() {
        let _ = tx.send(ExecResponse::failed(format!(
            "invalid exec arguments: pod name ({:?}) and container name ({:?}) must both be set",
            options.pod_name, options.container_name
        )));
        return rx;
    }

    tokio::spawn(async move {
        let response = executor.exec(&options).await;
        // The receiver is gone when the caller already timed out.
        let _ = tx.send(response);
    });
    rx
}

/// Run a command in a container and wait at most `timeout` for it.
pub async fn exec_in_pod(
    executor: &Arc<dyn RemoteExecutor>,
    options: &ExecOptions,
    timeout: Duration,
) -> Result<ExecResponse> {
    info!(
        command = %options.display_command(),
        container = %options.container_name,
        pod = %options.pod_name,
        "Executing command in container"
    );

    let rx = exec_in_container(executor.clone(), options.clone());

    tokio::select! {
        received = rx => {
            let response = received.map_err(|_| Error::Exec {
                pod: options.pod_name.clone(),
                container: options.container_name.clone(),
                message: "exec task ended without a response".to_string(),
            })?;
            if let Some(err) = &response.error {
                warn!(
                    container = %options.container_name,
                    pod = %options.pod_name,
                    stderr = %response.stderr,
                    "exec command failed"
                );
                let message = if response.stderr.trim().is_empty() {
                    err.clone()
                } else {
                    format!("{err} :: {}", response.stderr.trim())
                };
                return Err(Error::Exec {
                    pod: options.pod_name.clone(),
                    container: options.container_name.clone(),
                    message,
                });
            }
            info!(
                command = %options.display_command(),
                container = %options.container_name,
                pod = %options.pod_name,
                "{} Command executed successfully",
                crate::helpers::check_mark()
            );
            Ok(response)
        }
        _ = tokio::time::sleep(timeout) => {
            Err(Error::ExecTimeout {
                pod: options.pod_name.clone(),
                container: options.container_name.clone(),
            })
        }
    }
}
