use crate::{ExecutionMetadata, FlowError, StepError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type ContextData = BTreeMap<String, Value>;

/// State threaded through a run. The scheduler owns it and lends it to one step at a time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    #[serde(default)]
    pub data: ContextData,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    active_port: Option<String>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

impl FlowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(input: Value) -> Self {
        Self {
            input: Some(input),
            ..Self::default()
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Reads `a.b.0.c` style paths through nested objects and arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.data.get(path) {
            return Some(value);
        }
        let mut segments = path.split('.');
        let mut current = self.data.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn set_port(&mut self, port: impl Into<String>) {
        self.active_port = Some(port.into());
    }

    pub fn clear_port(&mut self) {
        self.active_port = None;
    }

    pub fn active_port(&self) -> Option<&str> {
        self.active_port.as_deref()
    }

    pub fn suspend(&mut self, node_id: impl Into<String>, reason: impl Into<String>) {
        self.metadata.suspended = true;
        self.metadata.suspended_at_node = Some(node_id.into());
        self.metadata.suspension_reason = Some(reason.into());
    }

    pub fn is_suspended(&self) -> bool {
        self.metadata.suspended
    }

    /// Fails once the current deadline has passed; otherwise records that the step polled it.
    pub fn check_deadline(&mut self, component: &str) -> Result<(), StepError> {
        if let Some(deadline) = self.metadata.deadline {
            let now = Utc::now();
            if now > deadline {
                return Err(StepError::DeadlineExceeded {
                    component: component.to_string(),
                    overdue: (now - deadline).to_std().unwrap_or_default(),
                });
            }
        }
        self.metadata.deadline_checked = true;
        Ok(())
    }

    pub fn to_value(&self) -> Result<Value, FlowError> {
        serde_json::to_value(self).map_err(|error| FlowError::Serialization(error.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, FlowError> {
        serde_json::from_value(value).map_err(|error| FlowError::Serialization(error.to_string()))
    }

    pub fn to_json(&self) -> Result<String, FlowError> {
        serde_json::to_string_pretty(self)
            .map_err(|error| FlowError::Serialization(error.to_string()))
    }

    pub fn from_json(source: &str) -> Result<Self, FlowError> {
        serde_json::from_str(source).map_err(|error| FlowError::Serialization(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn set_get_has_delete_expected_data_store_semantics() {
        let mut context = FlowContext::new();
        context.set("user", json!({"name": "ada", "tags": ["x", "y"]}));

        assert!(context.has("user"));
        assert_eq!(context.get_path("user.name"), Some(&json!("ada")));
        assert_eq!(context.get_path("user.tags.1"), Some(&json!("y")));
        assert_eq!(context.get_path("user.missing"), None);
        assert_eq!(context.delete("user"), Some(json!({"name": "ada", "tags": ["x", "y"]})));
        assert!(!context.has("user"));
    }

    #[test]
    fn get_path_literal_dotted_key_expected_direct_hit() {
        let mut context = FlowContext::new();
        context.set("a.b", json!(1));
        assert_eq!(context.get_path("a.b"), Some(&json!(1)));
    }

    #[test]
    fn round_trip_after_mutation_expected_identical_context() {
        let mut context = FlowContext::with_input(json!({"q": 1}));
        context.set("result", json!([1, 2, 3]));
        context.set_port("done");
        context
            .metadata
            .record_timing("a", Duration::from_millis(250), Utc::now(), None);
        context.metadata.node_visit_counts.insert("a".to_string(), 3);
        context.metadata.iteration_count = 2;
        context.metadata.max_iterations_reached = true;
        context.metadata.completed_nodes.push("deliver".to_string());
        context.suspend("gate", "awaiting approval");

        let restored = FlowContext::from_value(context.to_value().expect("to_value should succeed"))
            .expect("from_value should succeed");
        assert_eq!(restored, context);

        let from_json = FlowContext::from_json(&context.to_json().expect("to_json should succeed"))
            .expect("from_json should succeed");
        assert_eq!(from_json, context);
        assert_eq!(from_json.active_port(), Some("done"));
    }

    #[test]
    fn step_counter_after_restore_expected_continues_numbering() {
        let mut context = FlowContext::new();
        context
            .metadata
            .record_timing("a", Duration::from_secs(1), Utc::now(), None);
        context
            .metadata
            .record_timing("b", Duration::from_secs(2), Utc::now(), None);

        let mut restored = FlowContext::from_value(context.to_value().expect("serialize"))
            .expect("deserialize");
        restored
            .metadata
            .record_timing("c", Duration::from_secs(3), Utc::now(), None);
        assert_eq!(restored.metadata.step_timings[2].step_index, 2);
    }

    #[test]
    fn check_deadline_expired_expected_deadline_exceeded() {
        let mut context = FlowContext::new();
        context.metadata.deadline = Some(Utc::now() - ChronoDuration::seconds(1));
        let error = context
            .check_deadline("slow")
            .expect_err("expired deadline should fail");
        assert!(matches!(error, StepError::DeadlineExceeded { .. }));
        assert!(!context.metadata.deadline_checked);
    }

    #[test]
    fn check_deadline_future_or_absent_expected_flag_set() {
        let mut context = FlowContext::new();
        context.metadata.deadline = Some(Utc::now() + ChronoDuration::seconds(10));
        context
            .check_deadline("fast")
            .expect("future deadline should pass");
        assert!(context.metadata.deadline_checked);

        let mut context = FlowContext::new();
        context
            .check_deadline("fast")
            .expect("absent deadline should pass");
        assert!(context.metadata.deadline_checked);
    }

    #[test]
    fn suspend_expected_suspension_fields_set() {
        let mut context = FlowContext::new();
        context.suspend("approve", "needs human");
        assert!(context.is_suspended());
        assert_eq!(context.metadata.suspended_at_node.as_deref(), Some("approve"));
        assert_eq!(context.metadata.suspension_reason.as_deref(), Some("needs human"));
    }

    #[test]
    fn json_round_trip_full_precision_float_expected_exact_value() {
        let mut context = FlowContext::new();
        context.set("score", json!(0.9749512713538497));
        context.set("scores", json!([0.1, 2.0000000000000004, 1e-308]));

        let json = context.to_json().expect("context should serialize");
        let restored = FlowContext::from_json(&json).expect("context should deserialize");
        assert_eq!(restored.get("score"), Some(&json!(0.9749512713538497)));
        assert_eq!(restored.data, context.data);
    }
}
