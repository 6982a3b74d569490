use crate::checkpoint::CheckpointStoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        details: Vec<String>,
    },
    #[error("component not found: {0}")]
    ComponentNotFound(String),
    #[error("component '{component}' failed: {message}")]
    Component {
        component: String,
        kind: String,
        message: String,
    },
    #[error(
        "flow timeout exceeded: {:.2}s > {:.2}s",
        .elapsed.as_secs_f64(),
        .timeout.as_secs_f64()
    )]
    Timeout {
        timeout: Duration,
        elapsed: Duration,
        flow_id: String,
        step: Option<String>,
    },
    #[error(
        "component '{component}' took {:.2}s but never called check_deadline (threshold {:.2}s)",
        .duration.as_secs_f64(),
        .threshold.as_secs_f64()
    )]
    DeadlineCheck {
        component: String,
        duration: Duration,
        threshold: Duration,
        flow_id: String,
    },
    #[error("cycle at node '{cycle_entry_node}' reached max_iterations={max_iterations}")]
    MaxIterations {
        max_iterations: u32,
        actual_iterations: u32,
        cycle_entry_node: String,
        flow_id: String,
    },
    #[error("execution error: {0}")]
    Execution(String),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointStoreError),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FlowError {
    pub fn configuration(message: impl Into<String>, details: Vec<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            details,
        }
    }

    /// Timeout-kind errors are fatal to the run and bypass node error policies.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::DeadlineCheck { .. })
    }
}

/// Failure raised by a component from inside its lifecycle methods.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StepError {
    #[error("{message}")]
    Failed { kind: String, message: String },
    #[error(
        "Deadline exceeded in '{component}' ({:.2}s past deadline)",
        .overdue.as_secs_f64()
    )]
    DeadlineExceeded { component: String, overdue: Duration },
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            kind: "StepError".to_string(),
            message: message.into(),
        }
    }

    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Failed { kind, .. } => kind,
            Self::DeadlineExceeded { .. } => "DeadlineExceeded",
        }
    }
}
