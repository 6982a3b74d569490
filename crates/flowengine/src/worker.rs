use crate::config::ConfigMap;
use crate::{Component, ComponentRegistry, FlowContext, FlowError, StepError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Command line that starts a worker process speaking the JSON protocol on stdio.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-invokes the running executable with `subcommand`.
    pub fn current_exe(subcommand: &str) -> Result<Self, FlowError> {
        let program = std::env::current_exe().map_err(|error| {
            FlowError::Execution(format!("cannot locate current executable: {error}"))
        })?;
        Ok(Self::new(program).arg(subcommand))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub config: ConfigMap,
    pub context: FlowContext,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ok {
        context: FlowContext,
    },
    Error {
        kind: String,
        message: String,
    },
    DeadlineExceeded {
        component: String,
        overdue_seconds: f64,
    },
}

impl WorkerResponse {
    fn from_step_error(error: StepError) -> Self {
        match error {
            StepError::DeadlineExceeded { component, overdue } => Self::DeadlineExceeded {
                component,
                overdue_seconds: overdue.as_secs_f64(),
            },
            StepError::Failed { kind, message } => Self::Error { kind, message },
        }
    }
}

/// Builds the requested component, runs `process_async` once and reports the result.
pub async fn handle_request(registry: &ComponentRegistry, request: WorkerRequest) -> WorkerResponse {
    let Some(mut component) = registry.create(&request.kind, &request.name) else {
        return WorkerResponse::Error {
            kind: "ComponentNotFound".to_string(),
            message: format!("unknown component type: {}", request.kind),
        };
    };
    component.init(request.config);

    let mut context = request.context;
    match component.process_async(&mut context).await {
        Ok(()) => WorkerResponse::Ok { context },
        Err(error) => WorkerResponse::from_step_error(error),
    }
}

/// Worker side of the protocol: one request from `reader`, one response to `writer`.
pub async fn serve_worker<R, W>(
    registry: &ComponentRegistry,
    mut reader: R,
    mut writer: W,
) -> Result<(), FlowError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = String::new();
    reader
        .read_to_string(&mut raw)
        .await
        .map_err(|error| FlowError::Execution(format!("worker stdin read failed: {error}")))?;

    let response = match serde_json::from_str::<WorkerRequest>(&raw) {
        Ok(request) => {
            debug!(kind = %request.kind, name = %request.name, "worker request received");
            handle_request(registry, request).await
        }
        Err(error) => WorkerResponse::Error {
            kind: "ProtocolError".to_string(),
            message: format!("invalid worker request: {error}"),
        },
    };

    let encoded = serde_json::to_vec(&response)
        .map_err(|error| FlowError::Serialization(error.to_string()))?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|error| FlowError::Execution(format!("worker stdout write failed: {error}")))?;
    writer
        .flush()
        .await
        .map_err(|error| FlowError::Execution(format!("worker stdout flush failed: {error}")))?;
    Ok(())
}

pub(crate) enum WorkerOutcome {
    Completed(FlowContext),
    TimedOut,
}

/// Orchestrator side: ships one `process` call to a fresh child and waits at most `limit`.
/// The child is killed when the wait is abandoned.
pub(crate) async fn run_in_worker(
    worker: &WorkerCommand,
    component: &dyn Component,
    context: &FlowContext,
    limit: Option<Duration>,
) -> Result<WorkerOutcome, StepError> {
    let request = WorkerRequest {
        kind: component.kind().to_string(),
        name: component.name().to_string(),
        config: component.config().clone(),
        context: context.clone(),
    };
    let payload = serde_json::to_vec(&request)
        .map_err(|error| StepError::with_kind("WorkerError", error.to_string()))?;

    let mut child = tokio::process::Command::new(&worker.program)
        .args(&worker.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| {
            StepError::with_kind(
                "WorkerError",
                format!("failed to spawn worker {}: {error}", worker.program.display()),
            )
        })?;

    let exchange = async move {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            drop(stdin);
        }
        child.wait_with_output().await
    };

    let output = match limit {
        Some(limit) => match tokio::time::timeout(limit, exchange).await {
            Ok(output) => output,
            Err(_) => return Ok(WorkerOutcome::TimedOut),
        },
        None => exchange.await,
    }
    .map_err(|error| StepError::with_kind("WorkerError", format!("worker I/O failed: {error}")))?;

    let response: WorkerResponse = serde_json::from_slice(&output.stdout).map_err(|error| {
        StepError::with_kind(
            "WorkerError",
            format!(
                "worker exited with {} and an unreadable response: {error}",
                output.status
            ),
        )
    })?;

    match response {
        WorkerResponse::Ok { context } => Ok(WorkerOutcome::Completed(context)),
        WorkerResponse::Error { kind, message } => Err(StepError::Failed { kind, message }),
        WorkerResponse::DeadlineExceeded {
            component,
            overdue_seconds,
        } => Err(StepError::DeadlineExceeded {
            component,
            overdue: Duration::try_from_secs_f64(overdue_seconds).unwrap_or_default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(kind: &str, config: serde_json::Value) -> WorkerRequest {
        let config = match config {
            serde_json::Value::Object(map) => map,
            _ => ConfigMap::new(),
        };
        WorkerRequest {
            kind: kind.to_string(),
            name: "step".to_string(),
            config,
            context: FlowContext::new(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn serve_worker_builtin_set_expected_ok_with_updated_context() {
        let registry = ComponentRegistry::builtin();
        let input = serde_json::to_vec(&request(
            "flowengine.set",
            json!({"values": {"greeting": "hi"}}),
        ))
        .expect("request should serialize");
        let mut output = Vec::new();

        serve_worker(&registry, input.as_slice(), &mut output)
            .await
            .expect("worker should serve");

        let response: WorkerResponse =
            serde_json::from_slice(&output).expect("response should parse");
        let context = match response {
            WorkerResponse::Ok { context } => context,
            other => panic!("expected ok response, got {other:?}"),
        };
        assert_eq!(context.get("greeting"), Some(&json!("hi")));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handle_request_failing_component_expected_error_response() {
        let response = handle_request(
            &ComponentRegistry::builtin(),
            request("flowengine.fail", json!({"message": "boom"})),
        )
        .await;
        assert_eq!(
            response,
            WorkerResponse::Error {
                kind: "StepError".to_string(),
                message: "boom".to_string(),
            }
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handle_request_unknown_kind_expected_component_not_found() {
        let response = handle_request(
            &ComponentRegistry::builtin(),
            request("nope.missing", json!({})),
        )
        .await;
        assert!(matches!(
            response,
            WorkerResponse::Error { ref kind, .. } if kind == "ComponentNotFound"
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn serve_worker_garbage_input_expected_protocol_error() {
        let mut output = Vec::new();
        serve_worker(&ComponentRegistry::builtin(), &b"not json"[..], &mut output)
            .await
            .expect("worker should still reply");
        let response: WorkerResponse =
            serde_json::from_slice(&output).expect("response should parse");
        assert!(matches!(
            response,
            WorkerResponse::Error { ref kind, .. } if kind == "ProtocolError"
        ));
    }

    #[test]
    fn response_serialization_expected_status_tag() {
        let value = serde_json::to_value(WorkerResponse::Error {
            kind: "StepError".to_string(),
            message: "boom".to_string(),
        })
        .expect("response should serialize");
        assert_eq!(value, json!({"status": "error", "kind": "StepError", "message": "boom"}));
    }
}
