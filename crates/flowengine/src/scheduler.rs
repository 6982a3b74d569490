use crate::routing::reachable_targets;
use crate::step::{NodeExecutor, StepOutcome};
use crate::{
    CycleAnalysis, FlowContext, FlowError, FlowGraph, FlowSettings, HookSet, MaxIterationsPolicy,
    NodeConfig, SharedComponent, WorkerCommand,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Executes a flow graph one node at a time.
///
/// Cycle analysis happens once in [`GraphScheduler::new`]. Acyclic graphs run in topological
/// order with activation tracking; cyclic graphs run from a FIFO ready queue bounded by
/// per-node visit caps and the flow-level iteration cap.
pub struct GraphScheduler {
    graph: FlowGraph,
    analysis: CycleAnalysis,
    executor: NodeExecutor,
}

impl GraphScheduler {
    pub fn new(
        graph: FlowGraph,
        components: BTreeMap<String, SharedComponent>,
        settings: FlowSettings,
    ) -> Result<Self, FlowError> {
        let analysis = CycleAnalysis::analyze(&graph);
        if !analysis.has_cycles() {
            graph.topological_order()?;
        }
        Ok(Self {
            graph,
            analysis,
            executor: NodeExecutor {
                components,
                settings,
                hooks: HookSet::default(),
                worker: None,
            },
        })
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.executor.hooks = hooks;
        self
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.executor.worker = Some(worker);
        self
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn analysis(&self) -> &CycleAnalysis {
        &self.analysis
    }

    pub fn has_cycles(&self) -> bool {
        self.analysis.has_cycles()
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.executor.settings
    }

    pub fn component(&self, name: &str) -> Option<&SharedComponent> {
        self.executor.components.get(name)
    }

    pub fn components(&self) -> impl Iterator<Item = (&str, &SharedComponent)> {
        self.executor
            .components
            .iter()
            .map(|(name, component)| (name.as_str(), component))
    }

    /// Runs until the graph is exhausted, the context is suspended, or a fatal error occurs.
    pub async fn execute(&self, context: &mut FlowContext) -> Result<(), FlowError> {
        let resume_from = context.metadata.take_resume_point();
        if self.has_cycles() {
            self.execute_cyclic(context, resume_from).await
        } else {
            self.execute_dag(context, resume_from.as_deref()).await
        }
    }

    async fn execute_dag(
        &self,
        context: &mut FlowContext,
        resume_from: Option<&str>,
    ) -> Result<(), FlowError> {
        let flow_started = Instant::now();
        let order = self.graph.topological_order()?;
        let mut activated: BTreeSet<&str> = self.graph.roots().into_iter().collect();
        // The port that led to the suspended node is gone after a restore.
        if let Some(node) = resume_from.and_then(|node_id| self.graph.node(node_id)) {
            activated.insert(node.id.as_str());
        }

        for node_id in order {
            let Some(node) = self.graph.node(node_id) else {
                continue;
            };

            if context
                .metadata
                .completed_nodes
                .iter()
                .any(|completed| completed == node_id)
            {
                debug!(node_id, "skipping already-completed node");
                activated.extend(reachable_targets(&self.graph, node_id, None));
                continue;
            }

            if !activated.contains(node_id) {
                info!(node_id, "skipping unreachable node");
                context
                    .metadata
                    .skipped_components
                    .push(node.component.clone());
                self.executor
                    .hooks
                    .node_skipped(node_id, &node.component, "unreachable");
                continue;
            }

            let outcome = self.executor.execute(node, context, flow_started).await?;
            if context.is_suspended() {
                self.on_suspended(node_id, context);
                return Ok(());
            }

            context.metadata.completed_nodes.push(node_id.to_string());
            if outcome != StepOutcome::Skipped {
                activated.extend(reachable_targets(
                    &self.graph,
                    node_id,
                    context.active_port(),
                ));
            }
        }

        Ok(())
    }

    async fn execute_cyclic(
        &self,
        context: &mut FlowContext,
        resume_from: Option<String>,
    ) -> Result<(), FlowError> {
        let flow_started = Instant::now();
        let roots = self.analysis.roots(&self.graph);
        let mut visit_counts = context.metadata.node_visit_counts.clone();
        let mut iteration = context.metadata.iteration_count;
        let mut iteration_started: Option<Instant> = None;

        let mut resuming = resume_from.is_some();
        let mut ready: VecDeque<String> = match resume_from {
            Some(node_id) => VecDeque::from([node_id]),
            None => roots.iter().map(|root| root.to_string()).collect(),
        };

        while let Some(node_id) = ready.pop_front() {
            let node = self.graph.node(&node_id).ok_or_else(|| {
                FlowError::Execution(format!("unknown node in ready queue: {node_id}"))
            })?;

            // The resumed node already passed its cap and iteration checks before suspending.
            let resumed_entry = std::mem::take(&mut resuming);
            let visits = visit_counts.get(&node_id).copied().unwrap_or(0);
            if !resumed_entry && visits >= self.effective_max_visits(node) {
                continue;
            }

            if !resumed_entry && self.analysis.is_back_edge_target(&node_id) && visits > 0 {
                let now = Instant::now();
                self.executor.hooks.iteration_complete(
                    iteration,
                    &node_id,
                    context,
                    now.duration_since(iteration_started.unwrap_or(flow_started)),
                );
                iteration += 1;
                context.metadata.iteration_count = iteration;
                iteration_started = Some(now);
                self.executor
                    .hooks
                    .iteration_start(iteration, &node_id, context);

                if iteration > self.settings().max_iterations {
                    self.handle_max_iterations(context, &node_id, iteration)?;
                    break;
                }
            }

            let outcome = self.executor.execute(node, context, flow_started).await?;

            // A visit that ends in suspension is not counted; the resumed run repeats it.
            if context.is_suspended() {
                self.on_suspended(&node_id, context);
                return Ok(());
            }

            visit_counts.insert(node_id.clone(), visits + 1);
            context.metadata.node_visit_counts = visit_counts.clone();

            if !self.analysis.is_cycle_node(&node_id) {
                context.metadata.completed_nodes.push(node_id.clone());
            }

            if outcome != StepOutcome::Skipped {
                ready.extend(
                    reachable_targets(&self.graph, &node_id, context.active_port())
                        .into_iter()
                        .map(str::to_string),
                );
            }
        }

        if iteration > 0 && !context.is_suspended() {
            let entry_node = self
                .analysis
                .back_edge_targets()
                .iter()
                .next()
                .map(String::as_str)
                .or_else(|| roots.first().copied())
                .unwrap_or_default();
            self.executor.hooks.iteration_complete(
                iteration,
                entry_node,
                context,
                iteration_started.unwrap_or(flow_started).elapsed(),
            );
        }

        Ok(())
    }

    /// Per-node cap when declared, otherwise the flow-level iteration cap.
    pub fn effective_max_visits(&self, node: &NodeConfig) -> u32 {
        node.max_visits.unwrap_or(self.settings().max_iterations)
    }

    fn handle_max_iterations(
        &self,
        context: &mut FlowContext,
        node_id: &str,
        iteration: u32,
    ) -> Result<(), FlowError> {
        let max_iterations = self.settings().max_iterations;
        context.metadata.max_iterations_reached = true;
        self.executor
            .hooks
            .max_iterations(max_iterations, node_id, context);

        match self.settings().on_max_iterations {
            MaxIterationsPolicy::Fail => Err(FlowError::MaxIterations {
                max_iterations,
                actual_iterations: iteration,
                cycle_entry_node: node_id.to_string(),
                flow_id: context.metadata.flow_id.clone(),
            }),
            MaxIterationsPolicy::Warn => {
                warn!(
                    node_id,
                    max_iterations,
                    actual_iterations = iteration,
                    "max iterations reached"
                );
                Ok(())
            }
            MaxIterationsPolicy::Exit => Ok(()),
        }
    }

    /// Pins the resume point to the node that suspended, whatever label the component used.
    fn on_suspended(&self, node_id: &str, context: &mut FlowContext) {
        context.metadata.suspended_at_node = Some(node_id.to_string());
        let reason = context
            .metadata
            .suspension_reason
            .as_deref()
            .unwrap_or_default();
        self.executor.hooks.flow_suspended(node_id, reason, None);
    }
}
