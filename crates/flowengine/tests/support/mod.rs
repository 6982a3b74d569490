#![allow(dead_code)]

use async_trait::async_trait;
use flowengine::{
    BoxedComponent, Component, ComponentBase, ComponentMap, EngineOptions, ExecutionHook,
    FlowConfig, FlowContext, FlowEngine, StepError,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

macro_rules! base_accessors {
    () => {
        fn base(&self) -> &ComponentBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ComponentBase {
            &mut self.base
        }
    };
}

/// Appends its name to data key `order`; sets `config.port` when present.
pub struct Append {
    base: ComponentBase,
}

impl Append {
    pub fn boxed(name: &str) -> BoxedComponent {
        Box::new(Self {
            base: ComponentBase::new(name, "test.append"),
        })
    }
}

#[async_trait]
impl Component for Append {
    base_accessors!();

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        push_order(context, self.name());
        if let Some(port) = self.base.config_str("port") {
            self.set_output_port(context, port);
        }
        Ok(())
    }
}

/// Counts its own runs under `decide_count`; routes to `done` once `config.threshold` is hit.
pub struct Decide {
    base: ComponentBase,
}

impl Decide {
    pub fn boxed(name: &str) -> BoxedComponent {
        Box::new(Self {
            base: ComponentBase::new(name, "test.decide"),
        })
    }
}

#[async_trait]
impl Component for Decide {
    base_accessors!();

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        push_order(context, self.name());
        let count = context
            .get("decide_count")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            + 1;
        context.set("decide_count", json!(count));
        let threshold = self.base.config.get("threshold").and_then(Value::as_i64).unwrap_or(3);
        let port = if count >= threshold { "done" } else { "continue" };
        self.set_output_port(context, port);
        Ok(())
    }
}

/// Sets a port and then fails, so routing must ignore the port.
pub struct Failing {
    base: ComponentBase,
}

impl Failing {
    pub fn boxed(name: &str) -> BoxedComponent {
        Box::new(Self {
            base: ComponentBase::new(name, "test.failing"),
        })
    }
}

#[async_trait]
impl Component for Failing {
    base_accessors!();

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        self.set_output_port(context, "next");
        Err(StepError::with_kind("ValueError", "boom"))
    }
}

/// Sleeps `config.millis` without ever polling the deadline.
pub struct Blocking {
    base: ComponentBase,
}

impl Blocking {
    pub fn boxed(name: &str) -> BoxedComponent {
        Box::new(Self {
            base: ComponentBase::new(name, "test.blocking"),
        })
    }
}

#[async_trait]
impl Component for Blocking {
    base_accessors!();

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        let millis = self.base.config.get("millis").and_then(Value::as_u64).unwrap_or(0);
        std::thread::sleep(Duration::from_millis(millis));
        push_order(context, self.name());
        Ok(())
    }
}

/// Async sleep of `config.millis` that counts teardowns and never polls the deadline.
pub struct SlowAsync {
    base: ComponentBase,
    pub teardowns: Arc<AtomicUsize>,
}

impl SlowAsync {
    pub fn boxed(name: &str) -> (BoxedComponent, Arc<AtomicUsize>) {
        let teardowns = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Self {
                base: ComponentBase::new(name, "test.slow_async"),
                teardowns: Arc::clone(&teardowns),
            }),
            teardowns,
        )
    }
}

#[async_trait]
impl Component for SlowAsync {
    base_accessors!();

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        push_order(context, self.name());
        Ok(())
    }

    async fn process_async(&self, context: &mut FlowContext) -> Result<(), StepError> {
        let millis = self.base.config.get("millis").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        push_order(context, self.name());
        Ok(())
    }

    fn teardown(&self, _context: &mut FlowContext) -> Result<(), StepError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records itself like [`Append`], but suspends once the node has `config.after_visits`
/// (default 0) counted visits and no `resume_data` is present.
pub struct Gate {
    base: ComponentBase,
}

impl Gate {
    pub fn boxed(name: &str) -> BoxedComponent {
        Box::new(Self {
            base: ComponentBase::new(name, "test.gate"),
        })
    }
}

#[async_trait]
impl Component for Gate {
    base_accessors!();

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        let after_visits = self
            .base
            .config
            .get("after_visits")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let visits = u64::from(context.metadata.visit_count(self.name()));
        if context.has("resume_data") || visits < after_visits {
            push_order(context, self.name());
            return Ok(());
        }
        context.suspend(self.name(), "waiting for input");
        Ok(())
    }
}

/// Rejects any configuration without `required`.
pub struct Picky {
    base: ComponentBase,
}

impl Picky {
    pub fn boxed(name: &str) -> BoxedComponent {
        Box::new(Self {
            base: ComponentBase::new(name, "test.picky"),
        })
    }
}

#[async_trait]
impl Component for Picky {
    base_accessors!();

    fn validate_config(&self) -> Vec<String> {
        if self.base.config.contains_key("required") {
            Vec::new()
        } else {
            vec!["required is missing".to_string()]
        }
    }

    fn process(&self, _context: &mut FlowContext) -> Result<(), StepError> {
        Ok(())
    }
}

/// Hook that records every callback as a short string.
#[derive(Default)]
pub struct RecordingHook {
    pub events: Mutex<Vec<String>>,
}

impl RecordingHook {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events mutex should lock").clone()
    }

    fn record(&self, event: String) {
        self.events
            .lock()
            .expect("events mutex should lock")
            .push(event);
    }
}

impl ExecutionHook for RecordingHook {
    fn on_node_start(&self, node_id: &str, _component: &str, _context: &FlowContext) {
        self.record(format!("start:{node_id}"));
    }

    fn on_node_complete(
        &self,
        node_id: &str,
        _component: &str,
        _context: &FlowContext,
        _duration: Duration,
    ) {
        self.record(format!("complete:{node_id}"));
    }

    fn on_node_error(
        &self,
        node_id: &str,
        _component: &str,
        error: &StepError,
        _context: &FlowContext,
    ) {
        self.record(format!("error:{node_id}:{}", error.kind()));
    }

    fn on_node_skipped(&self, node_id: &str, _component: &str, reason: &str) {
        self.record(format!("skipped:{node_id}:{reason}"));
    }

    fn on_flow_suspended(&self, node_id: &str, _reason: &str, checkpoint_id: Option<&str>) {
        self.record(format!(
            "suspended:{node_id}:{}",
            checkpoint_id.unwrap_or("none")
        ));
    }

    fn on_iteration_start(&self, iteration: u32, node_id: &str, _context: &FlowContext) {
        self.record(format!("iteration_start:{iteration}:{node_id}"));
    }

    fn on_iteration_complete(
        &self,
        iteration: u32,
        node_id: &str,
        _context: &FlowContext,
        _duration: Duration,
    ) {
        self.record(format!("iteration_complete:{iteration}:{node_id}"));
    }

    fn on_max_iterations(&self, max_iterations: u32, node_id: &str, _context: &FlowContext) {
        self.record(format!("max_iterations:{max_iterations}:{node_id}"));
    }
}

/// Hook whose every callback panics.
pub struct PanickingHook;

impl ExecutionHook for PanickingHook {
    fn on_node_start(&self, _node_id: &str, _component: &str, _context: &FlowContext) {
        panic!("observer failure");
    }

    fn on_node_complete(
        &self,
        _node_id: &str,
        _component: &str,
        _context: &FlowContext,
        _duration: Duration,
    ) {
        panic!("observer failure");
    }
}

pub fn push_order(context: &mut FlowContext, name: &str) {
    let mut order = match context.get("order") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    order.push(json!(name));
    context.set("order", Value::Array(order));
}

pub fn order(context: &FlowContext) -> Vec<String> {
    match context.get("order") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Builds a flow config, declaring one component per node. A node's optional `config`
/// object becomes its component's declared config.
pub fn flow_config(nodes: Value, edges: Value, settings: Value) -> FlowConfig {
    let components: Vec<Value> = nodes
        .as_array()
        .expect("nodes should be an array")
        .iter()
        .map(|node| {
            let component = node["component"].as_str().expect("node should name a component");
            let config = node.get("config").cloned().unwrap_or_else(|| json!({}));
            json!({"name": component, "type": "test.component", "config": config})
        })
        .collect();
    let config: FlowConfig = serde_json::from_value(json!({
        "name": "test-flow",
        "components": components,
        "flow": {"settings": settings, "nodes": nodes, "edges": edges}
    }))
    .expect("test config should deserialize");
    config
}

pub fn components(entries: Vec<(&str, BoxedComponent)>) -> ComponentMap {
    entries
        .into_iter()
        .map(|(name, component)| (name.to_string(), component))
        .collect()
}

pub fn engine(config: FlowConfig, components: ComponentMap) -> FlowEngine {
    FlowEngine::new(config, components, EngineOptions::default())
        .expect("engine should build")
}

pub fn engine_with(
    config: FlowConfig,
    components: ComponentMap,
    options: EngineOptions,
) -> FlowEngine {
    FlowEngine::new(config, components, options).expect("engine should build")
}
