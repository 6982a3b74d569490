use crate::{
    Checkpoint, ComponentMap, ComponentRegistry, FlowConfig, FlowContext, FlowError, FlowGraph,
    GraphScheduler, HookSet, SharedCheckpointStore, SharedComponent, SharedExecutionHook,
    TimeoutMode, WorkerCommand, build_components,
};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const CHECKPOINT_ID_KEY: &str = "checkpoint_id";
pub const RESUME_DATA_KEY: &str = "resume_data";

/// Optional collaborators for a [`FlowEngine`].
#[derive(Clone, Default)]
pub struct EngineOptions {
    pub checkpoint_store: Option<SharedCheckpointStore>,
    pub hooks: Vec<SharedExecutionHook>,
    pub worker: Option<WorkerCommand>,
}

impl EngineOptions {
    pub fn checkpoint_store(mut self, store: SharedCheckpointStore) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn hook(mut self, hook: SharedExecutionHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = Some(worker);
        self
    }
}

/// Validated flow bound to its component instances, ready to run any number of times.
pub struct FlowEngine {
    config: FlowConfig,
    scheduler: GraphScheduler,
    checkpoint_store: Option<SharedCheckpointStore>,
    digest: String,
}

impl FlowEngine {
    pub fn new(
        config: FlowConfig,
        mut components: ComponentMap,
        options: EngineOptions,
    ) -> Result<Self, FlowError> {
        config.validate_or_raise()?;

        for node in &config.flow.nodes {
            if !components.contains_key(&node.component) {
                return Err(FlowError::ComponentNotFound(format!(
                    "Component not found for node '{}': {}",
                    node.id, node.component
                )));
            }
        }

        let mut problems = Vec::new();
        for (name, component) in components.iter_mut() {
            let declared = config
                .component_config(name)
                .map(|declared| declared.config.clone())
                .unwrap_or_default();
            component.init(declared);
            problems.extend(
                component
                    .validate_config()
                    .into_iter()
                    .map(|problem| format!("{name}: {problem}")),
            );
        }
        if !problems.is_empty() {
            return Err(FlowError::configuration(
                "component configuration is invalid",
                problems,
            ));
        }

        if config.settings().timeout_mode == TimeoutMode::HardProcess && options.worker.is_none() {
            return Err(FlowError::configuration(
                "hard_process timeout mode requires a worker command",
                Vec::new(),
            ));
        }

        let shared: BTreeMap<String, SharedComponent> = components
            .into_iter()
            .map(|(name, component)| (name, SharedComponent::from(component)))
            .collect();
        let graph = FlowGraph::new(config.flow.nodes.clone(), config.flow.edges.clone())?;
        let mut scheduler = GraphScheduler::new(graph, shared, config.settings().clone())?
            .with_hooks(HookSet::new(options.hooks));
        if let Some(worker) = options.worker {
            scheduler = scheduler.with_worker(worker);
        }
        let digest = config.digest()?;

        Ok(Self {
            config,
            scheduler,
            checkpoint_store: options.checkpoint_store,
            digest,
        })
    }

    /// Instantiates the declared components from `registry`, then builds the engine.
    pub fn from_registry(
        config: FlowConfig,
        registry: &ComponentRegistry,
        options: EngineOptions,
    ) -> Result<Self, FlowError> {
        let components = build_components(&config, registry)?;
        Self::new(config, components, options)
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &GraphScheduler {
        &self.scheduler
    }

    pub fn has_cycles(&self) -> bool {
        self.scheduler.has_cycles()
    }

    pub fn config_digest(&self) -> &str {
        &self.digest
    }

    /// Runs a fresh context carrying `input`.
    pub async fn run(&self, input: Option<Value>) -> Result<FlowContext, FlowError> {
        let mut context = FlowContext::new();
        context.input = input;
        self.execute(&mut context).await?;
        Ok(context)
    }

    /// Runs the graph against `context`. On suspension the context is checkpointed when a
    /// store is configured, and the checkpoint id is written to data key `checkpoint_id`.
    pub async fn execute(&self, context: &mut FlowContext) -> Result<(), FlowError> {
        info!(
            flow = %self.config.name,
            flow_id = %context.metadata.flow_id,
            cyclic = self.has_cycles(),
            "starting graph flow execution"
        );

        let result = self.scheduler.execute(context).await;
        if !context.is_suspended() {
            context.metadata.completed_at = Some(Utc::now());
        }
        result?;

        if context.is_suspended() {
            if let Some(store) = self.checkpoint_store.as_ref() {
                let checkpoint = Checkpoint::new(self.config.clone(), context.clone())
                    .with_digest(self.digest.clone());
                let checkpoint_id = store.save(checkpoint).await?;
                context.set(CHECKPOINT_ID_KEY, json!(checkpoint_id));
            }
        }

        info!(
            flow_id = %context.metadata.flow_id,
            status = if context.is_suspended() { "suspended" } else { "completed" },
            components_executed = context.metadata.component_timings.len(),
            "flow finished"
        );
        Ok(())
    }

    /// Continues a suspended run from its checkpoint. The consumed checkpoint is deleted; a
    /// run that suspends again is saved under a new id.
    pub async fn resume(
        &self,
        checkpoint_id: &str,
        resume_data: Option<Value>,
    ) -> Result<FlowContext, FlowError> {
        let store = self
            .checkpoint_store
            .as_ref()
            .ok_or_else(|| FlowError::Execution("No checkpoint store configured".to_string()))?;
        let checkpoint = store.load(checkpoint_id).await?.ok_or_else(|| {
            FlowError::Execution(format!("Checkpoint not found: {checkpoint_id}"))
        })?;

        if let Some(digest) = checkpoint.config_digest.as_deref() {
            if digest != self.digest {
                warn!(
                    checkpoint_id,
                    "checkpoint was created from a different flow configuration"
                );
            }
        }

        let mut context = checkpoint.context;
        context.metadata.clear_suspension();
        if let Some(data) = resume_data.filter(|data| !data.is_null()) {
            context.set(RESUME_DATA_KEY, data);
        }

        self.execute(&mut context).await?;
        store.delete(checkpoint_id).await?;
        Ok(context)
    }

    /// Problems that would stop this flow from running, as readable strings.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.config.validate();
        for node in &self.config.flow.nodes {
            if self.scheduler.component(&node.component).is_none() {
                problems.push(format!("Unknown component: {}", node.component));
            }
        }
        for (name, component) in self.scheduler.components() {
            problems.extend(
                component
                    .validate_config()
                    .into_iter()
                    .map(|problem| format!("{name}: {problem}")),
            );
        }
        problems
    }

    /// Component names in the order they would run: topological for acyclic graphs,
    /// declaration order when the graph has cycles.
    pub fn dry_run(&self) -> Result<Vec<String>, FlowError> {
        let graph = self.scheduler.graph();
        let order: Vec<&str> = if self.has_cycles() {
            graph.node_ids().collect()
        } else {
            graph.topological_order()?
        };
        Ok(order
            .into_iter()
            .filter_map(|node_id| graph.node(node_id))
            .map(|node| node.component.clone())
            .collect())
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("flow", &self.config.name)
            .field("cyclic", &self.has_cycles())
            .field("checkpoints", &self.checkpoint_store.is_some())
            .finish()
    }
}
