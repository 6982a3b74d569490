use crate::worker::{WorkerOutcome, run_in_worker};
use crate::{Component, FlowContext, FlowError, SharedComponent, StepError, WorkerCommand};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::warn;

/// A cooperative step running longer than this without polling its deadline is reported.
pub const DEADLINE_CHECK_WARNING_THRESHOLD: Duration = Duration::from_secs(1);

pub(crate) enum StepFailure {
    /// Failure raised by the component; subject to the node's error policy.
    Step(StepError),
    /// Ends the run regardless of policy.
    Fatal(FlowError),
}

impl From<StepError> for StepFailure {
    fn from(error: StepError) -> Self {
        Self::Step(error)
    }
}

impl From<FlowError> for StepFailure {
    fn from(error: FlowError) -> Self {
        Self::Fatal(error)
    }
}

/// Time left for one step, and what to report when it runs out.
pub(crate) struct StepBudget<'a> {
    pub node_id: &'a str,
    pub configured: Option<Duration>,
    pub remaining: Option<Duration>,
    pub flow_started: Instant,
}

impl StepBudget<'_> {
    pub fn timeout_error(&self, flow_id: &str) -> FlowError {
        let elapsed = self.flow_started.elapsed();
        FlowError::Timeout {
            timeout: self.configured.unwrap_or(elapsed),
            elapsed,
            flow_id: flow_id.to_string(),
            step: Some(self.node_id.to_string()),
        }
    }
}

/// Runs the step in-line. The component is trusted to poll `check_deadline`.
pub(crate) async fn run_cooperative(
    component: &dyn Component,
    context: &mut FlowContext,
) -> Result<(), StepFailure> {
    component.setup(context)?;
    let processed = component.process_async(context).await;
    let torn_down = component.teardown(context);
    context.metadata.deadline = None;
    processed?;
    torn_down?;
    Ok(())
}

/// Runs `process_async` on a blocking-pool thread that drives its own copy of the context,
/// so a step that never yields cannot stall the scheduler's runtime. The copy replaces the
/// caller's context only when the step finishes in time.
pub(crate) async fn run_hard_async(
    component: &SharedComponent,
    context: &mut FlowContext,
    budget: &StepBudget<'_>,
) -> Result<(), StepFailure> {
    component.setup(context)?;

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let isolated = Arc::clone(component);
    let mut isolated_context = context.clone();
    let handle = tokio::runtime::Handle::current();
    let task = tokio::task::spawn_blocking(move || {
        handle.block_on(async move {
            let run = async move {
                let result = isolated.process_async(&mut isolated_context).await;
                (isolated_context, result)
            };
            tokio::select! {
                outcome = run => Some(outcome),
                _ = cancel_rx => None,
            }
        })
    });

    let joined = match budget.remaining {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                drop(cancel_tx);
                teardown_after_timeout(component.as_ref(), context);
                return Err(budget.timeout_error(&context.metadata.flow_id).into());
            }
        },
        None => task.await,
    };
    drop(cancel_tx);

    let processed = match joined {
        Ok(Some((updated, result))) => {
            *context = updated;
            result
        }
        Ok(None) => Err(StepError::with_kind(
            "Cancelled",
            format!("component '{}' was cancelled", component.name()),
        )),
        Err(join_error) if join_error.is_panic() => Err(StepError::with_kind(
            "Panic",
            format!("component '{}' panicked", component.name()),
        )),
        Err(join_error) => Err(StepError::with_kind("Cancelled", join_error.to_string())),
    };

    let torn_down = component.teardown(context);
    context.metadata.deadline = None;
    processed?;
    torn_down?;
    Ok(())
}

/// Ships `process` to a worker process. Setup and teardown stay in this process.
pub(crate) async fn run_hard_process(
    component: &dyn Component,
    worker: Option<&WorkerCommand>,
    context: &mut FlowContext,
    budget: &StepBudget<'_>,
) -> Result<(), StepFailure> {
    let Some(worker) = worker else {
        return Err(FlowError::configuration(
            "hard_process timeout mode requires a worker command",
            Vec::new(),
        )
        .into());
    };

    component.setup(context)?;
    let processed = match run_in_worker(worker, component, context, budget.remaining).await {
        Ok(WorkerOutcome::Completed(updated)) => {
            *context = updated;
            Ok(())
        }
        Ok(WorkerOutcome::TimedOut) => {
            teardown_after_timeout(component, context);
            return Err(budget.timeout_error(&context.metadata.flow_id).into());
        }
        Err(error) => Err(error),
    };

    let torn_down = component.teardown(context);
    context.metadata.deadline = None;
    processed?;
    torn_down?;
    Ok(())
}

fn teardown_after_timeout(component: &dyn Component, context: &mut FlowContext) {
    if let Err(error) = component.teardown(context) {
        warn!(
            component = %component.name(),
            error = %error,
            "teardown failed after timeout"
        );
    }
    context.metadata.deadline = None;
}
