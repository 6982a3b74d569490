use crate::config::ConfigMap;
use crate::{FlowContext, StepError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// State every component carries: instance name, registry type key and stored config.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentBase {
    pub name: String,
    pub kind: String,
    pub config: ConfigMap,
    pub initialized: bool,
}

impl ComponentBase {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            config: ConfigMap::new(),
            initialized: false,
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(Value::as_f64)
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }
}

/// Unit of work bound to a graph node.
///
/// Only `process` must be provided. `teardown` is always invoked after `setup` succeeded,
/// even when `process` fails or is cancelled by a hard timeout.
#[async_trait]
pub trait Component: Send + Sync {
    fn base(&self) -> &ComponentBase;

    fn base_mut(&mut self) -> &mut ComponentBase;

    fn name(&self) -> &str {
        &self.base().name
    }

    fn kind(&self) -> &str {
        &self.base().kind
    }

    fn config(&self) -> &ConfigMap {
        &self.base().config
    }

    fn init(&mut self, config: ConfigMap) {
        let base = self.base_mut();
        base.config = config;
        base.initialized = true;
    }

    fn is_initialized(&self) -> bool {
        self.base().initialized
    }

    fn validate_config(&self) -> Vec<String> {
        Vec::new()
    }

    fn setup(&self, _context: &mut FlowContext) -> Result<(), StepError> {
        Ok(())
    }

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError>;

    async fn process_async(&self, context: &mut FlowContext) -> Result<(), StepError> {
        self.process(context)
    }

    fn teardown(&self, _context: &mut FlowContext) -> Result<(), StepError> {
        Ok(())
    }

    fn check_deadline(&self, context: &mut FlowContext) -> Result<(), StepError> {
        context.check_deadline(self.name())
    }

    fn set_output_port(&self, context: &mut FlowContext, port: &str) {
        context.set_port(port);
    }

    fn health_check(&self) -> bool {
        self.is_initialized()
    }
}

pub type BoxedComponent = Box<dyn Component>;
pub type SharedComponent = Arc<dyn Component>;
pub type ComponentMap = BTreeMap<String, BoxedComponent>;
