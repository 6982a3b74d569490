//! Components shipped with the engine, registered under `flowengine.*` type keys.

use crate::{Component, ComponentBase, ComponentRegistry, FlowContext, StepError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

pub const SET_KIND: &str = "flowengine.set";
pub const SLEEP_KIND: &str = "flowengine.sleep";
pub const ROUTE_KIND: &str = "flowengine.route";
pub const COUNTER_KIND: &str = "flowengine.counter";
pub const FAIL_KIND: &str = "flowengine.fail";
pub const APPROVAL_KIND: &str = "flowengine.approval";

const DEFAULT_CHECK_INTERVAL_SECONDS: f64 = 0.1;

pub fn register_builtin(registry: &mut ComponentRegistry) {
    registry.register_fn(SET_KIND, |name| Box::new(SetValues::new(name)));
    registry.register_fn(SLEEP_KIND, |name| Box::new(Sleep::new(name)));
    registry.register_fn(ROUTE_KIND, |name| Box::new(Route::new(name)));
    registry.register_fn(COUNTER_KIND, |name| Box::new(Counter::new(name)));
    registry.register_fn(FAIL_KIND, |name| Box::new(Fail::new(name)));
    registry.register_fn(APPROVAL_KIND, |name| Box::new(Approval::new(name)));
}

macro_rules! component_base {
    () => {
        fn base(&self) -> &ComponentBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ComponentBase {
            &mut self.base
        }
    };
}

/// Copies every entry of `config.values` into context data.
pub struct SetValues {
    base: ComponentBase,
}

impl SetValues {
    pub fn new(name: &str) -> Self {
        Self {
            base: ComponentBase::new(name, SET_KIND),
        }
    }
}

#[async_trait]
impl Component for SetValues {
    component_base!();

    fn validate_config(&self) -> Vec<String> {
        match self.base.config.get("values") {
            None | Some(Value::Object(_)) => Vec::new(),
            Some(_) => vec!["values must be an object".to_string()],
        }
    }

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        if let Some(Value::Object(values)) = self.base.config.get("values") {
            for (key, value) in values {
                context.set(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Waits `seconds`, polling the deadline between slices when `cooperative` is true.
///
/// With `blocking: true` the async path also sleeps on the calling thread, which models a
/// component that holds its worker thread until it finishes.
pub struct Sleep {
    base: ComponentBase,
}

impl Sleep {
    pub fn new(name: &str) -> Self {
        Self {
            base: ComponentBase::new(name, SLEEP_KIND),
        }
    }

    fn total(&self) -> Duration {
        duration_from_config(self.base.config_f64("seconds").unwrap_or(0.0))
    }

    fn slice(&self) -> Duration {
        duration_from_config(
            self.base
                .config_f64("check_interval")
                .unwrap_or(DEFAULT_CHECK_INTERVAL_SECONDS),
        )
        .max(Duration::from_millis(1))
    }

    fn cooperative(&self) -> bool {
        self.base.config_bool("cooperative").unwrap_or(true)
    }

    fn blocking(&self) -> bool {
        self.base.config_bool("blocking").unwrap_or(false)
    }
}

#[async_trait]
impl Component for Sleep {
    component_base!();

    fn validate_config(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for key in ["seconds", "check_interval"] {
            if let Some(seconds) = self.base.config.get(key) {
                if !seconds.as_f64().is_some_and(|value| value >= 0.0) {
                    problems.push(format!("{key} must be a non-negative number"));
                }
            }
        }
        problems
    }

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        let mut left = self.total();
        while !left.is_zero() {
            if self.cooperative() {
                self.check_deadline(context)?;
            }
            let step = left.min(self.slice());
            std::thread::sleep(step);
            left -= step;
        }
        if self.cooperative() {
            self.check_deadline(context)?;
        }
        Ok(())
    }

    async fn process_async(&self, context: &mut FlowContext) -> Result<(), StepError> {
        if self.blocking() {
            return self.process(context);
        }
        let mut left = self.total();
        while !left.is_zero() {
            if self.cooperative() {
                self.check_deadline(context)?;
            }
            let step = left.min(self.slice());
            tokio::time::sleep(step).await;
            left -= step;
        }
        if self.cooperative() {
            self.check_deadline(context)?;
        }
        Ok(())
    }
}

/// Selects the output port named by the value at data path `config.key`, falling back to
/// `config.default`.
pub struct Route {
    base: ComponentBase,
}

impl Route {
    pub fn new(name: &str) -> Self {
        Self {
            base: ComponentBase::new(name, ROUTE_KIND),
        }
    }
}

#[async_trait]
impl Component for Route {
    component_base!();

    fn validate_config(&self) -> Vec<String> {
        if self.base.config_str("key").is_none() {
            return vec!["key is required".to_string()];
        }
        Vec::new()
    }

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        let selected = self
            .base
            .config_str("key")
            .and_then(|key| context.get_path(key))
            .and_then(port_name)
            .or_else(|| self.base.config_str("default").map(str::to_string));
        if let Some(port) = selected {
            self.set_output_port(context, &port);
        }
        Ok(())
    }
}

fn port_name(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Increments the integer at `config.key` (default `count`). With `limit` set it also routes
/// to `done` once the count reaches the limit and to `continue` before that.
pub struct Counter {
    base: ComponentBase,
}

impl Counter {
    pub fn new(name: &str) -> Self {
        Self {
            base: ComponentBase::new(name, COUNTER_KIND),
        }
    }
}

#[async_trait]
impl Component for Counter {
    component_base!();

    fn validate_config(&self) -> Vec<String> {
        match self.base.config.get("limit") {
            Some(limit) if limit.as_i64().is_none() => vec!["limit must be an integer".to_string()],
            _ => Vec::new(),
        }
    }

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        let key = self.base.config_str("key").unwrap_or("count");
        let count = match context.get(key) {
            None => 0,
            Some(value) => value.as_i64().ok_or_else(|| {
                StepError::with_kind("TypeError", format!("'{key}' is not an integer"))
            })?,
        } + 1;
        context.set(key, json!(count));

        if let Some(limit) = self.base.config.get("limit").and_then(Value::as_i64) {
            let port = if count >= limit { "done" } else { "continue" };
            self.set_output_port(context, port);
        }
        Ok(())
    }
}

/// Always fails with `config.message`.
pub struct Fail {
    base: ComponentBase,
}

impl Fail {
    pub fn new(name: &str) -> Self {
        Self {
            base: ComponentBase::new(name, FAIL_KIND),
        }
    }
}

#[async_trait]
impl Component for Fail {
    component_base!();

    fn process(&self, _context: &mut FlowContext) -> Result<(), StepError> {
        Err(StepError::failed(
            self.base.config_str("message").unwrap_or("component failed"),
        ))
    }
}

/// Human gate. Suspends until `resume_data.approved` is supplied, then records the decision
/// and routes to `approved` or `rejected`.
pub struct Approval {
    base: ComponentBase,
}

impl Approval {
    pub fn new(name: &str) -> Self {
        Self {
            base: ComponentBase::new(name, APPROVAL_KIND),
        }
    }
}

#[async_trait]
impl Component for Approval {
    component_base!();

    fn process(&self, context: &mut FlowContext) -> Result<(), StepError> {
        match context.get_path("resume_data.approved").and_then(Value::as_bool) {
            Some(approved) => {
                context.set("approved", json!(approved));
                self.set_output_port(context, if approved { "approved" } else { "rejected" });
            }
            None => {
                let reason = self
                    .base
                    .config_str("reason")
                    .unwrap_or("awaiting approval")
                    .to_string();
                context.suspend(self.name(), reason);
            }
        }
        Ok(())
    }
}

fn duration_from_config(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigMap;
    use chrono::Utc;

    fn build(kind: &str, config: Value) -> Box<dyn Component> {
        let mut component = ComponentRegistry::builtin()
            .create(kind, "step")
            .expect("builtin kind should be registered");
        let config = match config {
            Value::Object(map) => map,
            _ => ConfigMap::new(),
        };
        component.init(config);
        component
    }

    #[test]
    fn route_bool_value_expected_port_named_after_bool() {
        let component = build(ROUTE_KIND, json!({"key": "check.ok"}));
        let mut context = FlowContext::new();
        context.set("check", json!({"ok": true}));
        component.process(&mut context).expect("route should succeed");
        assert_eq!(context.active_port(), Some("true"));
    }

    #[test]
    fn route_missing_value_expected_default_port() {
        let component = build(ROUTE_KIND, json!({"key": "decision", "default": "refine"}));
        let mut context = FlowContext::new();
        component.process(&mut context).expect("route should succeed");
        assert_eq!(context.active_port(), Some("refine"));
    }

    #[test]
    fn counter_with_limit_expected_continue_then_done() {
        let component = build(COUNTER_KIND, json!({"key": "n", "limit": 2}));
        let mut context = FlowContext::new();
        component.process(&mut context).expect("first tick should succeed");
        assert_eq!(context.active_port(), Some("continue"));
        component.process(&mut context).expect("second tick should succeed");
        assert_eq!(context.active_port(), Some("done"));
        assert_eq!(context.get("n"), Some(&json!(2)));
    }

    #[test]
    fn counter_non_integer_expected_type_error() {
        let component = build(COUNTER_KIND, json!({}));
        let mut context = FlowContext::new();
        context.set("count", json!("three"));
        let error = component
            .process(&mut context)
            .expect_err("string count should fail");
        assert_eq!(error.kind(), "TypeError");
    }

    #[test]
    fn approval_without_resume_data_expected_suspended() {
        let component = build(APPROVAL_KIND, json!({"reason": "needs sign-off"}));
        let mut context = FlowContext::new();
        component.process(&mut context).expect("approval should succeed");
        assert!(context.is_suspended());
        assert_eq!(
            context.metadata.suspension_reason.as_deref(),
            Some("needs sign-off")
        );
    }

    #[test]
    fn approval_with_rejection_expected_rejected_port() {
        let component = build(APPROVAL_KIND, json!({}));
        let mut context = FlowContext::new();
        context.set("resume_data", json!({"approved": false}));
        component.process(&mut context).expect("approval should succeed");
        assert!(!context.is_suspended());
        assert_eq!(context.active_port(), Some("rejected"));
        assert_eq!(context.get("approved"), Some(&json!(false)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sleep_past_deadline_expected_deadline_exceeded() {
        let component = build(SLEEP_KIND, json!({"seconds": 1.0, "check_interval": 0.01}));
        let mut context = FlowContext::new();
        context.metadata.deadline = Some(Utc::now() + chrono::Duration::milliseconds(30));
        let error = component
            .process_async(&mut context)
            .await
            .expect_err("sleep should hit its deadline");
        assert!(matches!(error, StepError::DeadlineExceeded { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_sleep_async_path_expected_thread_held_until_done() {
        let component = build(
            SLEEP_KIND,
            json!({"seconds": 0.05, "blocking": true, "cooperative": false}),
        );
        let mut context = FlowContext::new();
        let finished_first = tokio::select! {
            biased;
            _ = tokio::time::sleep(Duration::from_millis(1)) => "timer",
            result = component.process_async(&mut context) => {
                result.expect("blocking sleep should succeed");
                "sleep"
            }
        };
        assert_eq!(finished_first, "sleep");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn yielding_sleep_async_path_expected_other_timers_fire() {
        let component = build(SLEEP_KIND, json!({"seconds": 0.5, "cooperative": false}));
        let mut context = FlowContext::new();
        let finished_first = tokio::select! {
            biased;
            _ = tokio::time::sleep(Duration::from_millis(1)) => "timer",
            _ = component.process_async(&mut context) => "sleep",
        };
        assert_eq!(finished_first, "timer");
    }

    #[test]
    fn sleep_negative_seconds_expected_validation_problem() {
        let component = build(SLEEP_KIND, json!({"seconds": -1}));
        assert_eq!(
            component.validate_config(),
            vec!["seconds must be a non-negative number".to_string()]
        );
    }
}
