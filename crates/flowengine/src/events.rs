use crate::{ExecutionHook, FlowContext, StepError};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: FlowEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum FlowEventKind {
    Node(NodeEvent),
    Iteration(IterationEvent),
    Flow(FlowLifecycleEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    Started {
        flow_id: String,
        node_id: String,
        component: String,
    },
    Completed {
        flow_id: String,
        node_id: String,
        component: String,
        duration_ms: u64,
        active_port: Option<String>,
    },
    Failed {
        flow_id: String,
        node_id: String,
        component: String,
        error_type: String,
        message: String,
    },
    Skipped {
        node_id: String,
        component: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IterationEvent {
    Started {
        flow_id: String,
        iteration: u32,
        node_id: String,
    },
    Completed {
        flow_id: String,
        iteration: u32,
        node_id: String,
        duration_ms: u64,
    },
    LimitReached {
        flow_id: String,
        max_iterations: u32,
        node_id: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowLifecycleEvent {
    Suspended {
        node_id: String,
        reason: String,
        checkpoint_id: Option<String>,
    },
}

pub trait FlowEventObserver: Send + Sync {
    fn on_event(&self, event: &FlowEvent);
}

impl<F> FlowEventObserver for F
where
    F: Fn(&FlowEvent) + Send + Sync,
{
    fn on_event(&self, event: &FlowEvent) {
        self(event);
    }
}

pub type SharedFlowEventObserver = Arc<dyn FlowEventObserver>;
pub type FlowEventSender = mpsc::UnboundedSender<FlowEvent>;
pub type FlowEventReceiver = mpsc::UnboundedReceiver<FlowEvent>;

/// Hook that turns lifecycle callbacks into sequenced [`FlowEvent`]s.
#[derive(Default)]
pub struct FlowEventSink {
    observer: Option<SharedFlowEventObserver>,
    sender: Option<FlowEventSender>,
    sequence: AtomicU64,
}

impl FlowEventSink {
    pub fn with_observer(observer: SharedFlowEventObserver) -> Self {
        Self {
            observer: Some(observer),
            ..Self::default()
        }
    }

    pub fn with_sender(sender: FlowEventSender) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    pub fn observer(mut self, observer: SharedFlowEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: FlowEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, kind: FlowEventKind) {
        if !self.is_enabled() {
            return;
        }
        let event = FlowEvent {
            sequence_no: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: timestamp_now(),
            kind,
        };
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

impl ExecutionHook for FlowEventSink {
    fn on_node_start(&self, node_id: &str, component: &str, context: &FlowContext) {
        self.emit(FlowEventKind::Node(NodeEvent::Started {
            flow_id: context.metadata.flow_id.clone(),
            node_id: node_id.to_string(),
            component: component.to_string(),
        }));
    }

    fn on_node_complete(
        &self,
        node_id: &str,
        component: &str,
        context: &FlowContext,
        duration: Duration,
    ) {
        self.emit(FlowEventKind::Node(NodeEvent::Completed {
            flow_id: context.metadata.flow_id.clone(),
            node_id: node_id.to_string(),
            component: component.to_string(),
            duration_ms: duration_millis(duration),
            active_port: context.active_port().map(str::to_string),
        }));
    }

    fn on_node_error(
        &self,
        node_id: &str,
        component: &str,
        error: &StepError,
        context: &FlowContext,
    ) {
        self.emit(FlowEventKind::Node(NodeEvent::Failed {
            flow_id: context.metadata.flow_id.clone(),
            node_id: node_id.to_string(),
            component: component.to_string(),
            error_type: error.kind().to_string(),
            message: error.to_string(),
        }));
    }

    fn on_node_skipped(&self, node_id: &str, component: &str, reason: &str) {
        self.emit(FlowEventKind::Node(NodeEvent::Skipped {
            node_id: node_id.to_string(),
            component: component.to_string(),
            reason: reason.to_string(),
        }));
    }

    fn on_flow_suspended(&self, node_id: &str, reason: &str, checkpoint_id: Option<&str>) {
        self.emit(FlowEventKind::Flow(FlowLifecycleEvent::Suspended {
            node_id: node_id.to_string(),
            reason: reason.to_string(),
            checkpoint_id: checkpoint_id.map(str::to_string),
        }));
    }

    fn on_iteration_start(&self, iteration: u32, node_id: &str, context: &FlowContext) {
        self.emit(FlowEventKind::Iteration(IterationEvent::Started {
            flow_id: context.metadata.flow_id.clone(),
            iteration,
            node_id: node_id.to_string(),
        }));
    }

    fn on_iteration_complete(
        &self,
        iteration: u32,
        node_id: &str,
        context: &FlowContext,
        duration: Duration,
    ) {
        self.emit(FlowEventKind::Iteration(IterationEvent::Completed {
            flow_id: context.metadata.flow_id.clone(),
            iteration,
            node_id: node_id.to_string(),
            duration_ms: duration_millis(duration),
        }));
    }

    fn on_max_iterations(&self, max_iterations: u32, node_id: &str, context: &FlowContext) {
        self.emit(FlowEventKind::Iteration(IterationEvent::LimitReached {
            flow_id: context.metadata.flow_id.clone(),
            max_iterations,
            node_id: node_id.to_string(),
        }));
    }
}

pub fn flow_event_channel() -> (FlowEventSender, FlowEventReceiver) {
    mpsc::unbounded_channel()
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
