use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// One executed step. `duration` is in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub component: String,
    pub duration: f64,
    pub started_at: DateTime<Utc>,
    pub step_index: usize,
    pub execution_order: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub component: String,
    pub error_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionErrorRecord {
    pub component: String,
    pub condition: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionMetadata {
    pub flow_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub step_timings: Vec<StepTiming>,
    pub component_timings: BTreeMap<String, f64>,
    pub skipped_components: Vec<String>,
    pub errors: Vec<ErrorRecord>,
    pub condition_errors: Vec<ConditionErrorRecord>,
    pub node_visit_counts: BTreeMap<String, u32>,
    pub iteration_count: u32,
    pub max_iterations_reached: bool,
    pub completed_nodes: Vec<String>,
    pub suspended: bool,
    pub suspended_at_node: Option<String>,
    pub suspension_reason: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub deadline_checked: bool,
}

impl Default for ExecutionMetadata {
    fn default() -> Self {
        Self {
            flow_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            completed_at: None,
            step_timings: Vec::new(),
            component_timings: BTreeMap::new(),
            skipped_components: Vec::new(),
            errors: Vec::new(),
            condition_errors: Vec::new(),
            node_visit_counts: BTreeMap::new(),
            iteration_count: 0,
            max_iterations_reached: false,
            completed_nodes: Vec::new(),
            suspended: false,
            suspended_at_node: None,
            suspension_reason: None,
            deadline: None,
            deadline_checked: false,
        }
    }
}

impl ExecutionMetadata {
    /// Appends a timing record and folds it into the per-component total.
    ///
    /// `execution_order` is the position in `step_timings`; `step_index` falls back to it,
    /// so numbering continues across a serialization round trip.
    pub fn record_timing(
        &mut self,
        component: &str,
        duration: Duration,
        started_at: DateTime<Utc>,
        step_index: Option<usize>,
    ) {
        let execution_order = self.step_timings.len();
        let seconds = duration.as_secs_f64();
        self.step_timings.push(StepTiming {
            component: component.to_string(),
            duration: seconds,
            started_at,
            step_index: step_index.unwrap_or(execution_order),
            execution_order,
        });
        *self
            .component_timings
            .entry(component.to_string())
            .or_insert(0.0) += seconds;
    }

    pub fn add_error(&mut self, component: &str, error_type: &str, message: &str) {
        self.errors.push(ErrorRecord {
            component: component.to_string(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn add_condition_error(&mut self, component: &str, condition: &str, message: &str) {
        self.condition_errors.push(ConditionErrorRecord {
            component: component.to_string(),
            condition: condition.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_condition_errors(&self) -> bool {
        !self.condition_errors.is_empty()
    }

    /// Wall-clock span of the run, when it has completed.
    pub fn total_duration(&self) -> Option<Duration> {
        let completed_at = self.completed_at?;
        (completed_at - self.started_at).to_std().ok()
    }

    pub fn visit_count(&self, node_id: &str) -> u32 {
        self.node_visit_counts.get(node_id).copied().unwrap_or(0)
    }

    pub(crate) fn clear_deadline(&mut self) {
        self.deadline = None;
        self.deadline_checked = false;
    }

    /// Lifts the suspension but keeps `suspended_at_node` as the resume point for the
    /// next scheduler pass, which consumes it.
    pub(crate) fn clear_suspension(&mut self) {
        self.suspended = false;
        self.suspension_reason = None;
    }

    pub(crate) fn take_resume_point(&mut self) -> Option<String> {
        if self.suspended {
            return None;
        }
        self.suspended_at_node.take()
    }
}
