use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::preflight::catalog::Outcome;
use crate::preflight::CheckContext;
use crate::resources::{capability_pod, POD_CAPABILITY_CASES};

use super::Check;

/// Pods with the security settings the application needs can be admitted
/// and become Ready: root and privileged, plain non-root, and non-root with
/// privilege escalation.
///
/// Each pod is deleted once Ready. The first case that fails ends the check
/// and its pod is left for the cleanup pass.
pub struct PodCapability;

#[async_trait]
impl Check for PodCapability {
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Outcome> {
        let provisioner = ctx.provisioner();
        let total = POD_CAPABILITY_CASES.len();

        for (index, case) in POD_CAPABILITY_CASES.iter().enumerate() {
            info!(
                case = index + 1,
                user_id = case.user_id,
                "Checking pod capability validation case {}/{total}",
                index + 1
            );
            let pod = capability_pod(&ctx.provision, index, case, &ctx.uid);
            let ready = match provisioner.create_pod_and_wait(&pod).await {
                Ok(ready) => ready,
                Err(e) => {
                    error!(
                        user_id = case.user_id,
                        privileged = case.privileged,
                        allow_privilege_escalation = case.allow_privilege_escalation,
                        "Pod capability validation case {}/{total} failed :: {e}",
                        index + 1
                    );
                    return Err(e);
                }
            };

            let name = ready.name_any();
            match provisioner.delete_pod(&name).await {
                Ok(()) => info!(pod = %name, "Deleted capability validator pod successfully"),
                Err(e) => warn!(pod = %name, error = %e, "Problem occurred deleting capability validator pod"),
            }
        }
        Ok(Outcome::Passed)
    }
}
