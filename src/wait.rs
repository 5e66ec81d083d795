//! Condition-wait engine: poll a predicate over cluster state with
//! exponential backoff until it holds or the step budget runs out.
//!
//! Predicate errors are not retried. The first error returned by a predicate
//! ends the wait and is handed straight back to the caller.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::Client;
use rand::Rng;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Backoff policy for a single wait. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Number of times the predicate is evaluated.
    pub steps: u32,
    /// Base interval before the first retry.
    pub duration: Duration,
    /// Multiplier applied to the interval after every step.
    pub factor: f64,
    /// Upper bound on the random extra fraction added to each interval.
    pub jitter: f64,
}

impl Backoff {
    /// 120 steps of 5 s with 10% jitter, roughly ten minutes in total.
    pub fn default_retry() -> Self {
        Self {
            steps: 120,
            duration: Duration::from_secs(5),
            factor: 1.0,
            jitter: 0.1,
        }
    }

    /// Sleep schedule between predicate evaluations.
    ///
    /// Yields `steps - 1` delays: there is nothing to wait for after the last
    /// evaluation.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let sleeps = self.steps.saturating_sub(1);
        (0..sleeps).map(move |attempt| {
            let base = self.duration.as_secs_f64() * self.factor.powi(attempt as i32);
            let extra = if self.jitter > 0.0 {
                rand::thread_rng().gen_range(0.0..self.jitter) * base
            } else {
                0.0
            };
            Duration::from_secs_f64(base + extra)
        })
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::default_retry()
    }
}

/// Result of a completed wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    NotReached,
}

/// Evaluate `predicate` until it returns `Ok(true)`, the budget is exhausted,
/// or it returns an error.
pub async fn wait_for_condition<F, Fut>(
    backoff: &Backoff,
    what: &str,
    mut predicate: F,
) -> Result<WaitOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut delays = backoff.delays();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if predicate().await? {
            debug!(what, attempt, "condition reached");
            return Ok(WaitOutcome::Reached);
        }
        match delays.next() {
            Some(delay) => {
                debug!(what, attempt, delay_ms = delay.as_millis() as u64, "condition not met yet");
                tokio::time::sleep(delay).await;
            }
            None => {
                info!(what, attempts = attempt, "gave up waiting for condition");
                return Ok(WaitOutcome::NotReached);
            }
        }
    }
}

/// True when the pod reports `condition` with status `True`.
pub async fn pod_has_condition(
    client: &Client,
    namespace: &str,
    name: &str,
    condition: &str,
) -> Result<bool> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pods.get(name).await?;
    Ok(pod
        .status
        .and_then(|s| s.conditions)
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == condition && c.status == "True"))
}

/// True when the VolumeSnapshot reports `status.readyToUse: true`.
pub async fn volume_snapshot_ready(
    client: &Client,
    ar: &ApiResource,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, ar);
    let snapshot = api.get(name).await?;
    Ok(snapshot
        .data
        .pointer("/status/readyToUse")
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

/// Block until the pod is `Ready`, or fail with [`Error::WaitTimeout`].
pub async fn wait_until_pod_ready(
    client: &Client,
    backoff: &Backoff,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let what = format!("pod {namespace}/{name}");
    let outcome = wait_for_condition(backoff, &what, || {
        pod_has_condition(client, namespace, name, "Ready")
    })
    .await?;
    match outcome {
        WaitOutcome::Reached => Ok(()),
        WaitOutcome::NotReached => Err(Error::WaitTimeout(format!("{what} (Ready)"))),
    }
}

/// True once the pod no longer exists.
pub async fn pod_is_gone(client: &Client, namespace: &str, name: &str) -> Result<bool> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    Ok(pods.get_opt(name).await?.is_none())
}

/// Block until the pod has been removed from the API server, or fail with
/// [`Error::WaitTimeout`]. A pod that is merely terminating still counts as
/// present.
pub async fn wait_until_pod_deleted(
    client: &Client,
    backoff: &Backoff,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let what = format!("pod {namespace}/{name}");
    let outcome = wait_for_condition(backoff, &what, || pod_is_gone(client, namespace, name)).await?;
    match outcome {
        WaitOutcome::Reached => Ok(()),
        WaitOutcome::NotReached => Err(Error::WaitTimeout(format!("{what} (deleted)"))),
    }
}

/// Block until the VolumeSnapshot is ready to use, or fail with
/// [`Error::WaitTimeout`].
pub async fn wait_until_snapshot_ready(
    client: &Client,
    ar: &ApiResource,
    backoff: &Backoff,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let what = format!("volume snapshot {namespace}/{name}");
    let outcome = wait_for_condition(backoff, &what, || {
        volume_snapshot_ready(client, ar, namespace, name)
    })
    .await?;
    match outcome {
        WaitOutcome::Reached => Ok(()),
        WaitOutcome::NotReached => Err(Error::WaitTimeout(format!("{what} (readyToUse)"))),
    }
}
