use crate::{FlowContext, StepError};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Lifecycle observer. Every callback is optional.
///
/// Callbacks run synchronously on the scheduler's thread. A panicking callback is
/// discarded and never affects the run.
pub trait ExecutionHook: Send + Sync {
    fn on_node_start(&self, _node_id: &str, _component: &str, _context: &FlowContext) {}

    fn on_node_complete(
        &self,
        _node_id: &str,
        _component: &str,
        _context: &FlowContext,
        _duration: Duration,
    ) {
    }

    fn on_node_error(
        &self,
        _node_id: &str,
        _component: &str,
        _error: &StepError,
        _context: &FlowContext,
    ) {
    }

    fn on_node_skipped(&self, _node_id: &str, _component: &str, _reason: &str) {}

    fn on_flow_suspended(&self, _node_id: &str, _reason: &str, _checkpoint_id: Option<&str>) {}

    fn on_iteration_start(&self, _iteration: u32, _node_id: &str, _context: &FlowContext) {}

    fn on_iteration_complete(
        &self,
        _iteration: u32,
        _node_id: &str,
        _context: &FlowContext,
        _duration: Duration,
    ) {
    }

    fn on_max_iterations(&self, _max_iterations: u32, _node_id: &str, _context: &FlowContext) {}
}

pub type SharedExecutionHook = Arc<dyn ExecutionHook>;

/// Ordered fan-out to registered hooks.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<SharedExecutionHook>,
}

impl HookSet {
    pub fn new(hooks: Vec<SharedExecutionHook>) -> Self {
        Self { hooks }
    }

    pub fn push(&mut self, hook: SharedExecutionHook) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn notify(&self, callback: &'static str, call: impl Fn(&dyn ExecutionHook)) {
        for hook in &self.hooks {
            let outcome = catch_unwind(AssertUnwindSafe(|| call(hook.as_ref())));
            if outcome.is_err() {
                warn!(callback, "execution hook panicked; ignoring");
            }
        }
    }

    pub fn node_start(&self, node_id: &str, component: &str, context: &FlowContext) {
        self.notify("on_node_start", |hook| {
            hook.on_node_start(node_id, component, context)
        });
    }

    pub fn node_complete(
        &self,
        node_id: &str,
        component: &str,
        context: &FlowContext,
        duration: Duration,
    ) {
        self.notify("on_node_complete", |hook| {
            hook.on_node_complete(node_id, component, context, duration)
        });
    }

    pub fn node_error(
        &self,
        node_id: &str,
        component: &str,
        error: &StepError,
        context: &FlowContext,
    ) {
        self.notify("on_node_error", |hook| {
            hook.on_node_error(node_id, component, error, context)
        });
    }

    pub fn node_skipped(&self, node_id: &str, component: &str, reason: &str) {
        self.notify("on_node_skipped", |hook| {
            hook.on_node_skipped(node_id, component, reason)
        });
    }

    pub fn flow_suspended(&self, node_id: &str, reason: &str, checkpoint_id: Option<&str>) {
        self.notify("on_flow_suspended", |hook| {
            hook.on_flow_suspended(node_id, reason, checkpoint_id)
        });
    }

    pub fn iteration_start(&self, iteration: u32, node_id: &str, context: &FlowContext) {
        self.notify("on_iteration_start", |hook| {
            hook.on_iteration_start(iteration, node_id, context)
        });
    }

    pub fn iteration_complete(
        &self,
        iteration: u32,
        node_id: &str,
        context: &FlowContext,
        duration: Duration,
    ) {
        self.notify("on_iteration_complete", |hook| {
            hook.on_iteration_complete(iteration, node_id, context, duration)
        });
    }

    pub fn max_iterations(&self, max_iterations: u32, node_id: &str, context: &FlowContext) {
        self.notify("on_max_iterations", |hook| {
            hook.on_max_iterations(max_iterations, node_id, context)
        });
    }
}
