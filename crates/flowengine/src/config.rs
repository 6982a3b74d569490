use crate::FlowError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub type ConfigMap = Map<String, Value>;

pub const MIN_MAX_ITERATIONS: u32 = 1;
pub const MAX_MAX_ITERATIONS: u32 = 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub components: Vec<ComponentConfig>,
    pub flow: FlowDefinition,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: ConfigMap,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default)]
    pub settings: FlowSettings,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    Fail,
    Skip,
    Continue,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutMode {
    #[default]
    Cooperative,
    HardAsync,
    HardProcess,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxIterationsPolicy {
    #[default]
    Fail,
    Warn,
    Exit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub fail_fast: bool,
    pub timeout_seconds: Option<f64>,
    pub timeout_mode: TimeoutMode,
    pub require_deadline_check: bool,
    pub max_iterations: u32,
    pub on_max_iterations: MaxIterationsPolicy,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            fail_fast: true,
            timeout_seconds: Some(300.0),
            timeout_mode: TimeoutMode::Cooperative,
            require_deadline_check: false,
            max_iterations: 10,
            on_max_iterations: MaxIterationsPolicy::Fail,
        }
    }
}

impl FlowSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .map(Duration::from_secs_f64)
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(seconds) = self.timeout_seconds {
            if !seconds.is_finite() || seconds <= 0.0 {
                problems.push(format!(
                    "timeout_seconds must be greater than 0 (got {seconds})"
                ));
            }
        }
        if !(MIN_MAX_ITERATIONS..=MAX_MAX_ITERATIONS).contains(&self.max_iterations) {
            problems.push(format!(
                "max_iterations must be within {MIN_MAX_ITERATIONS}..={MAX_MAX_ITERATIONS} (got {})",
                self.max_iterations
            ));
        }
        problems
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub component: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(default)]
    pub max_visits: Option<u32>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component: component.into(),
            description: None,
            on_error: ErrorPolicy::Fail,
            max_visits: None,
        }
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn max_visits(mut self, max_visits: u32) -> Self {
        self.max_visits = Some(max_visits);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub port: Option<String>,
}

impl EdgeConfig {
    pub fn always(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            port: None,
        }
    }

    pub fn on_port(
        source: impl Into<String>,
        target: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            port: Some(port.into()),
        }
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

impl FlowConfig {
    pub fn from_json_str(source: &str) -> Result<Self, FlowError> {
        let config: Self = serde_json::from_str(source).map_err(|error| {
            FlowError::configuration("failed to parse flow config", vec![error.to_string()])
        })?;
        config.validate_or_raise()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, FlowError> {
        let source = fs::read_to_string(path).map_err(|error| {
            FlowError::configuration(
                format!("failed reading flow config '{}'", path.display()),
                vec![error.to_string()],
            )
        })?;
        Self::from_json_str(&source)
    }

    pub fn component_config(&self, name: &str) -> Option<&ComponentConfig> {
        self.components.iter().find(|component| component.name == name)
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.flow.settings
    }

    /// Structural problems that make the flow unrunnable. Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.components.is_empty() {
            problems.push("flow must declare at least one component".to_string());
        }
        let mut component_names = BTreeSet::new();
        for component in &self.components {
            if !component_names.insert(component.name.as_str()) {
                problems.push(format!("duplicate component name '{}'", component.name));
            }
        }

        if self.flow.nodes.is_empty() {
            problems.push("graph flows require at least one node".to_string());
        }
        let mut node_ids = BTreeSet::new();
        for node in &self.flow.nodes {
            if !node_ids.insert(node.id.as_str()) {
                problems.push(format!("duplicate node id '{}'", node.id));
            }
            if !component_names.contains(node.component.as_str()) {
                problems.push(format!(
                    "node '{}' references unknown component '{}'",
                    node.id, node.component
                ));
            }
            if node.max_visits == Some(0) {
                problems.push(format!("node '{}' max_visits must be at least 1", node.id));
            }
        }

        for edge in &self.flow.edges {
            if !node_ids.contains(edge.source.as_str()) {
                problems.push(format!("edge source '{}' not found in nodes", edge.source));
            }
            if !node_ids.contains(edge.target.as_str()) {
                problems.push(format!("edge target '{}' not found in nodes", edge.target));
            }
        }

        problems.extend(self.flow.settings.problems());
        problems
    }

    pub fn validate_or_raise(&self) -> Result<(), FlowError> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        Err(FlowError::configuration(
            format!("flow '{}' is invalid", self.name),
            problems,
        ))
    }

    /// Content digest of the canonical JSON form, stored with checkpoints.
    pub fn digest(&self) -> Result<String, FlowError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|error| FlowError::Serialization(error.to_string()))?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}
