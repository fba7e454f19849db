use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ScriptBudget;
use crate::error::{OrchestratorError, Result};
use crate::infra::{GuestCredentials, GuestScriptExecutor, InfraError, ScriptOutput, VmGroupRef};
use crate::provisioner::scripts::READINESS_PROBE;

/// Runs scripts inside node guests under the readiness and retry budget.
#[derive(Clone)]
pub struct GuestRunner {
    executor: Arc<dyn GuestScriptExecutor>,
    credentials: GuestCredentials,
    budget: ScriptBudget,
}

impl GuestRunner {
    pub fn new(
        executor: Arc<dyn GuestScriptExecutor>,
        credentials: GuestCredentials,
        budget: ScriptBudget,
    ) -> Self {
        Self {
            executor,
            credentials,
            budget,
        }
    }

    /// Wait for guest tools, then probe until the guest accepts scripts.
    pub async fn wait_ready(&self, group: &VmGroupRef, vm: &str) -> Result<()> {
        self.executor.wait_until_tools_ready(group, vm).await?;

        for attempt in 1..=self.budget.readiness_attempts {
            match self
                .executor
                .execute_script(group, vm, &self.credentials, READINESS_PROBE)
                .await
            {
                Ok(output) if output.is_success() => {
                    debug!(vm, attempt, "Guest ready for scripts");
                    return Ok(());
                }
                Ok(output) => {
                    debug!(vm, attempt, exit_code = output.exit_code, "Guest not ready yet")
                }
                Err(e) => debug!(vm, attempt, error = %e, "Readiness probe failed"),
            }
            tokio::time::sleep(self.budget.readiness_interval()).await;
        }

        Err(OrchestratorError::script(vm, "VM is not ready to execute scripts"))
    }

    /// Execute `script`, retrying transport failures only.
    pub async fn execute(&self, group: &VmGroupRef, vm: &str, script: &str) -> Result<ScriptOutput> {
        let attempts = self.budget.retry_attempts.max(1);
        let mut last_error: Option<InfraError> = None;

        for attempt in 1..=attempts {
            match self
                .executor
                .execute_script(group, vm, &self.credentials, script)
                .await
            {
                Ok(output) => return Ok(output),
                Err(e) => {
                    warn!(vm, attempt, attempts, error = %e, "Script transport failure");
                    last_error = Some(e);
                }
            }
        }

        Err(OrchestratorError::script(
            vm,
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// Execute `script` and fail with the guest's stderr on a non-zero exit.
    pub async fn run(&self, group: &VmGroupRef, vm: &str, script: &str) -> Result<ScriptOutput> {
        let output = self.execute(group, vm, script).await?;
        if !output.is_success() {
            return Err(OrchestratorError::script(vm, output.stderr.trim()));
        }
        Ok(output)
    }

    /// Wait for readiness then run on one node.
    pub async fn run_when_ready(
        &self,
        group: &VmGroupRef,
        vm: &str,
        script: &str,
    ) -> Result<ScriptOutput> {
        self.wait_ready(group, vm).await?;
        self.run(group, vm, script).await
    }

    /// Run on every node in order, collecting per-node failures instead of stopping.
    pub async fn run_on_nodes(
        &self,
        group: &VmGroupRef,
        vms: &[String],
        script: &str,
    ) -> Vec<(String, Result<ScriptOutput>)> {
        let mut results = Vec::with_capacity(vms.len());
        for vm in vms {
            let result = self.run_when_ready(group, vm, script).await;
            results.push((vm.clone(), result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::infra::InfraResult;

    /// Replays scripted outcomes for every `execute_script` call.
    struct ReplayExecutor {
        outcomes: Mutex<Vec<InfraResult<ScriptOutput>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ReplayExecutor {
        fn new(outcomes: Vec<InfraResult<ScriptOutput>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GuestScriptExecutor for ReplayExecutor {
        async fn wait_until_tools_ready(&self, _group: &VmGroupRef, _vm: &str) -> InfraResult<()> {
            Ok(())
        }

        async fn execute_script(
            &self,
            _group: &VmGroupRef,
            _vm: &str,
            _credentials: &GuestCredentials,
            script: &str,
        ) -> InfraResult<ScriptOutput> {
            self.calls.lock().unwrap().push(script.to_string());
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(ScriptOutput::success("")))
        }
    }

    fn runner(executor: Arc<ReplayExecutor>, budget: ScriptBudget) -> GuestRunner {
        GuestRunner::new(executor, GuestCredentials::default(), budget)
    }

    fn group() -> VmGroupRef {
        VmGroupRef::new("vapp-1", "foo")
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_exhaustion() {
        let executor = ReplayExecutor::new(
            (0..5).map(|_| Ok(ScriptOutput::failure(1, "not yet"))).collect(),
        );
        let budget = ScriptBudget {
            readiness_attempts: 5,
            ..ScriptBudget::default()
        };

        let err = runner(executor.clone(), budget)
            .wait_ready(&group(), "node-abcd")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("VM is not ready to execute scripts"));
        assert_eq!(executor.calls().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_recovers() {
        let executor = ReplayExecutor::new(vec![
            Err(InfraError::request("tools restarting")),
            Ok(ScriptOutput::success("Linux")),
        ]);

        runner(executor.clone(), ScriptBudget::default())
            .wait_ready(&group(), "node-abcd")
            .await
            .unwrap();
        assert_eq!(executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let executor = ReplayExecutor::new(vec![Ok(ScriptOutput::failure(2, "kubeadm failed\n"))]);

        let err = runner(executor, ScriptBudget::default())
            .run(&group(), "mstr-abcd", "kubeadm init")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::ScriptExecution { ref node, ref message }
                if node == "mstr-abcd" && message == "kubeadm failed"
        ));
    }

    #[tokio::test]
    async fn test_transport_errors_retried_within_budget() {
        let executor = ReplayExecutor::new(vec![
            Err(InfraError::request("connection reset")),
            Ok(ScriptOutput::success("done")),
        ]);
        let budget = ScriptBudget {
            retry_attempts: 2,
            ..ScriptBudget::default()
        };

        let output = runner(executor.clone(), budget)
            .execute(&group(), "node-abcd", "true")
            .await
            .unwrap();
        assert_eq!(output.stdout, "done");
        assert_eq!(executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_default_budget_does_not_retry() {
        let executor = ReplayExecutor::new(vec![
            Err(InfraError::request("connection reset")),
            Ok(ScriptOutput::success("done")),
        ]);

        assert!(runner(executor.clone(), ScriptBudget::default())
            .execute(&group(), "node-abcd", "true")
            .await
            .is_err());
        assert_eq!(executor.calls().len(), 1);
    }
}
