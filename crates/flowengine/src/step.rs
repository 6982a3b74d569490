use crate::timeout::{
    DEADLINE_CHECK_WARNING_THRESHOLD, StepBudget, StepFailure, run_cooperative, run_hard_async,
    run_hard_process,
};
use crate::{
    ErrorPolicy, FlowContext, FlowError, FlowSettings, HookSet, NodeConfig, SharedComponent,
    StepError, TimeoutMode, WorkerCommand,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How a node's execution ended when it did not stop the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Failed under the `skip` policy; downstream edges stay dormant.
    Skipped,
    /// Failed under the `continue` policy; routes as if no port was chosen.
    Continued,
}

/// Runs a single node: timeout budget, hooks, lifecycle, timing and error policy.
pub(crate) struct NodeExecutor {
    pub components: BTreeMap<String, SharedComponent>,
    pub settings: FlowSettings,
    pub hooks: HookSet,
    pub worker: Option<WorkerCommand>,
}

impl NodeExecutor {
    pub async fn execute(
        &self,
        node: &NodeConfig,
        context: &mut FlowContext,
        flow_started: Instant,
    ) -> Result<StepOutcome, FlowError> {
        let component = self.components.get(&node.component).ok_or_else(|| {
            FlowError::ComponentNotFound(format!(
                "Component not found for node '{}': {}",
                node.id, node.component
            ))
        })?;

        let configured = self.settings.timeout();
        let remaining = match configured {
            Some(timeout) => {
                let elapsed = flow_started.elapsed();
                match timeout.checked_sub(elapsed) {
                    Some(remaining) if !remaining.is_zero() => Some(remaining),
                    _ => {
                        return Err(FlowError::Timeout {
                            timeout,
                            elapsed,
                            flow_id: context.metadata.flow_id.clone(),
                            step: Some(node.id.clone()),
                        });
                    }
                }
            }
            None => None,
        };
        let budget = StepBudget {
            node_id: &node.id,
            configured,
            remaining,
            flow_started,
        };

        context.clear_port();
        self.hooks.node_start(&node.id, &node.component, context);

        let started = Instant::now();
        let started_at = Utc::now();
        context.metadata.deadline = remaining
            .and_then(|remaining| chrono::Duration::from_std(remaining).ok())
            .and_then(|remaining| started_at.checked_add_signed(remaining));
        context.metadata.deadline_checked = false;

        let result = match self.settings.timeout_mode {
            TimeoutMode::Cooperative => run_cooperative(component.as_ref(), context).await,
            TimeoutMode::HardAsync => run_hard_async(component, context, &budget).await,
            TimeoutMode::HardProcess => {
                run_hard_process(component.as_ref(), self.worker.as_ref(), context, &budget).await
            }
        };
        let result = result.and_then(|()| {
            self.check_deadline_compliance(&node.component, context, started.elapsed())
        });

        let outcome = self.settle(node, context, result, &budget, started, started_at);
        context.metadata.clear_deadline();
        outcome
    }

    /// Cooperative steps that run past the threshold are expected to have polled their
    /// deadline at least once.
    fn check_deadline_compliance(
        &self,
        component: &str,
        context: &FlowContext,
        duration: Duration,
    ) -> Result<(), StepFailure> {
        if self.settings.timeout_mode != TimeoutMode::Cooperative
            || self.settings.timeout().is_none()
            || context.metadata.deadline_checked
            || duration <= DEADLINE_CHECK_WARNING_THRESHOLD
        {
            return Ok(());
        }

        if self.settings.require_deadline_check {
            return Err(StepFailure::Fatal(FlowError::DeadlineCheck {
                component: component.to_string(),
                duration,
                threshold: DEADLINE_CHECK_WARNING_THRESHOLD,
                flow_id: context.metadata.flow_id.clone(),
            }));
        }
        warn!(
            component,
            duration_secs = duration.as_secs_f64(),
            "component never called check_deadline; consider polling it for timeout compliance"
        );
        Ok(())
    }

    fn settle(
        &self,
        node: &NodeConfig,
        context: &mut FlowContext,
        result: Result<(), StepFailure>,
        budget: &StepBudget<'_>,
        started: Instant,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<StepOutcome, FlowError> {
        let duration = started.elapsed();
        context
            .metadata
            .record_timing(&node.component, duration, started_at, None);

        let error = match result {
            Ok(()) => {
                self.hooks
                    .node_complete(&node.id, &node.component, context, duration);
                info!(
                    node_id = %node.id,
                    component = %node.component,
                    duration_ms = duration.as_millis() as u64,
                    "node completed"
                );
                return Ok(StepOutcome::Completed);
            }
            Err(StepFailure::Fatal(error)) => return Err(error),
            Err(StepFailure::Step(StepError::DeadlineExceeded { .. })) => {
                return Err(budget.timeout_error(&context.metadata.flow_id));
            }
            Err(StepFailure::Step(error)) => error,
        };

        let message = error.to_string();
        context
            .metadata
            .add_error(&node.component, error.kind(), &message);
        self.hooks
            .node_error(&node.id, &node.component, &error, context);
        error!(
            node_id = %node.id,
            component = %node.component,
            error_type = error.kind(),
            error = %message,
            "node failed"
        );

        if self.settings.fail_fast || node.on_error == ErrorPolicy::Fail {
            return Err(FlowError::Component {
                component: node.component.clone(),
                kind: error.kind().to_string(),
                message,
            });
        }
        match node.on_error {
            ErrorPolicy::Skip => {
                context
                    .metadata
                    .skipped_components
                    .push(node.component.clone());
                Ok(StepOutcome::Skipped)
            }
            _ => {
                context.clear_port();
                Ok(StepOutcome::Continued)
            }
        }
    }
}
