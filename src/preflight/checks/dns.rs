use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::exec::{exec_in_pod, ExecOptions};
use crate::preflight::catalog::Outcome;
use crate::preflight::CheckContext;
use crate::resources::{dns_lookup_command, dns_pod, DNSUTILS_CONTAINER};

use super::Check;

/// `nslookup kubernetes.default` from inside a fresh pod.
///
/// The pod is removed right away only when resolution worked; otherwise it
/// is left for the cleanup pass so it can be inspected.
pub struct DnsResolution;

#[async_trait]
impl Check for DnsResolution {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        let provisioner = ctx.provisioner();
        let pod = provisioner
            .create_pod_and_wait(&dns_pod(&ctx.provision, &ctx.uid))
            .await?;
        let pod_name = pod.name_any();

        let command = dns_lookup_command();
        let options = ExecOptions {
            namespace: ctx.provision.namespace.clone(),
            pod_name: pod_name.clone(),
            container_name: DNSUTILS_CONTAINER.to_string(),
            command: command.clone(),
        };
        if let Err(e) = exec_in_pod(&ctx.cluster.executor, &options, ctx.exec_timeout).await {
            return Err(Error::check(format!(
                "not able to resolve DNS '{}' service inside pods :: {e}",
                command.last().map(String::as_str).unwrap_or_default()
            )));
        }

        match provisioner.delete_pod(&pod_name).await {
            Ok(()) => info!(pod = %pod_name, "Deleted DNS pod successfully"),
            Err(e) => warn!(pod = %pod_name, error = %e, "Problem occurred deleting DNS pod"),
        }
        Ok(Outcome::Passed)
    }
}
