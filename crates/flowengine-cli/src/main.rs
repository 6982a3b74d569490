use clap::{ArgAction, Parser, Subcommand};
use flowengine::{
    CHECKPOINT_ID_KEY, CheckpointStore, ComponentRegistry, EngineOptions, FlowConfig,
    FlowContext, FlowEngine, FlowEvent, FlowEventKind, FlowEventSink, FsCheckpointStore,
    WorkerCommand, flow_event_channel, serve_worker,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flowengine-cli")]
#[command(about = "Run, resume and inspect graph workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Resume(ResumeArgs),
    Validate(FlowArgs),
    DryRun(FlowArgs),
    InspectCheckpoint(InspectCheckpointArgs),
    /// Serve one component request on stdin/stdout (used by `hard_process` mode).
    #[command(hide = true)]
    Worker,
}

#[derive(clap::Args, Debug)]
struct FlowArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct EventArgs {
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// JSON value stored as the run's input.
    #[arg(long)]
    input: Option<String>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    #[command(flatten)]
    events: EventArgs,
}

#[derive(clap::Args, Debug)]
struct ResumeArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    checkpoint_dir: PathBuf,
    #[arg(long)]
    checkpoint_id: String,
    /// JSON value stored under `resume_data` before execution continues.
    #[arg(long)]
    resume_data: Option<String>,
    #[command(flatten)]
    events: EventArgs,
}

#[derive(clap::Args, Debug)]
struct InspectCheckpointArgs {
    #[arg(long)]
    checkpoint_dir: PathBuf,
    #[arg(long)]
    checkpoint_id: String,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowengine=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("error: failed to start async runtime: {error}");
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(async move {
        match cli.command {
            Commands::Run(args) => run_command(args).await,
            Commands::Resume(args) => resume_command(args).await,
            Commands::Validate(args) => validate_command(args),
            Commands::DryRun(args) => dry_run_command(args),
            Commands::InspectCheckpoint(args) => inspect_checkpoint_command(args).await,
            Commands::Worker => worker_command().await,
        }
    });
    // A hard_async step abandoned on timeout may still hold a blocking thread.
    runtime.shutdown_background();

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let config = load_config(&args.config)?;
    let input = args.input.as_deref().map(parse_json_arg).transpose()?;
    let (options, event_task) = engine_options(args.checkpoint_dir.as_deref(), &args.events)?;

    let engine = FlowEngine::from_registry(config, &ComponentRegistry::builtin(), options)
        .map_err(|error| error.to_string())?;
    let result = engine.run(input).await;
    drop(engine);
    finish_events(event_task).await?;

    let context = result.map_err(|error| error.to_string())?;
    print_run_summary(&context);
    Ok(ExitCode::SUCCESS)
}

async fn resume_command(args: ResumeArgs) -> Result<ExitCode, String> {
    let config = load_config(&args.config)?;
    let resume_data = args
        .resume_data
        .as_deref()
        .map(parse_json_arg)
        .transpose()?;
    let (options, event_task) = engine_options(Some(&args.checkpoint_dir), &args.events)?;

    let engine = FlowEngine::from_registry(config, &ComponentRegistry::builtin(), options)
        .map_err(|error| error.to_string())?;
    let result = engine.resume(&args.checkpoint_id, resume_data).await;
    drop(engine);
    finish_events(event_task).await?;

    let context = result.map_err(|error| error.to_string())?;
    print_run_summary(&context);
    Ok(ExitCode::SUCCESS)
}

fn validate_command(args: FlowArgs) -> Result<ExitCode, String> {
    let config = load_config(&args.config)?;
    let problems = match FlowEngine::from_registry(
        config,
        &ComponentRegistry::builtin(),
        EngineOptions::default(),
    ) {
        Ok(engine) => engine.validate(),
        Err(flowengine::FlowError::Configuration { message, details }) if !details.is_empty() => {
            details
                .into_iter()
                .map(|detail| format!("{message}: {detail}"))
                .collect()
        }
        Err(error) => vec![error.to_string()],
    };

    if problems.is_empty() {
        println!("valid");
        return Ok(ExitCode::SUCCESS);
    }
    for problem in &problems {
        println!("invalid: {problem}");
    }
    Ok(ExitCode::from(2))
}

fn dry_run_command(args: FlowArgs) -> Result<ExitCode, String> {
    let config = load_config(&args.config)?;
    let engine = FlowEngine::from_registry(
        config,
        &ComponentRegistry::builtin(),
        EngineOptions::default(),
    )
    .map_err(|error| error.to_string())?;
    println!("cyclic: {}", engine.has_cycles());
    for (index, component) in engine
        .dry_run()
        .map_err(|error| error.to_string())?
        .iter()
        .enumerate()
    {
        println!("{}. {component}", index + 1);
    }
    Ok(ExitCode::SUCCESS)
}

async fn inspect_checkpoint_command(args: InspectCheckpointArgs) -> Result<ExitCode, String> {
    let store = FsCheckpointStore::new(&args.checkpoint_dir).map_err(|error| error.to_string())?;
    let checkpoint = store
        .load(&args.checkpoint_id)
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| format!("Checkpoint not found: {}", args.checkpoint_id))?;

    if args.json {
        let json = checkpoint.to_json().map_err(|error| error.to_string())?;
        println!("{json}");
        return Ok(ExitCode::SUCCESS);
    }

    let metadata = &checkpoint.context.metadata;
    println!("checkpoint_id: {}", checkpoint.checkpoint_id);
    println!("flow: {}", checkpoint.flow_config.name);
    println!("created_at: {}", checkpoint.created_at.to_rfc3339());
    println!("flow_id: {}", metadata.flow_id);
    println!(
        "suspended_at_node: {}",
        metadata.suspended_at_node.as_deref().unwrap_or("<none>")
    );
    println!(
        "suspension_reason: {}",
        metadata.suspension_reason.as_deref().unwrap_or("<none>")
    );
    println!("completed_nodes: {}", metadata.completed_nodes.join(", "));
    println!("iteration_count: {}", metadata.iteration_count);
    println!("context_keys: {}", checkpoint.context.data.len());
    Ok(ExitCode::SUCCESS)
}

async fn worker_command() -> Result<ExitCode, String> {
    serve_worker(
        &ComponentRegistry::builtin(),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
    .map_err(|error| error.to_string())?;
    Ok(ExitCode::SUCCESS)
}

fn load_config(path: &Path) -> Result<FlowConfig, String> {
    FlowConfig::load_from_path(path)
        .map_err(|error| format!("failed reading flow config '{}': {error}", path.display()))
}

fn parse_json_arg(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|error| format!("invalid JSON argument: {error}"))
}

fn engine_options(
    checkpoint_dir: Option<&Path>,
    events: &EventArgs,
) -> Result<(EngineOptions, Option<tokio::task::JoinHandle<()>>), String> {
    let mut options = EngineOptions::default()
        .worker(WorkerCommand::current_exe("worker").map_err(|error| error.to_string())?);
    if let Some(dir) = checkpoint_dir {
        let store = FsCheckpointStore::new(dir).map_err(|error| error.to_string())?;
        options = options.checkpoint_store(Arc::new(store));
    }

    if events.no_stream_events {
        return Ok((options, None));
    }
    let event_json = events.event_json;
    let (tx, mut rx) = flow_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    let sink = FlowEventSink::with_sender(tx);
    Ok((options.hook(Arc::new(sink)), Some(task)))
}

async fn finish_events(task: Option<tokio::task::JoinHandle<()>>) -> Result<(), String> {
    if let Some(task) = task {
        task.await.map_err(|error| error.to_string())?;
    }
    Ok(())
}

fn print_event_text(event: &FlowEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event_kind_label(&event.kind)
    );
}

fn event_kind_label(kind: &FlowEventKind) -> &'static str {
    match kind {
        FlowEventKind::Node(_) => "node",
        FlowEventKind::Iteration(_) => "iteration",
        FlowEventKind::Flow(_) => "flow",
    }
}

fn print_run_summary(context: &FlowContext) {
    let metadata = &context.metadata;
    println!("flow_id: {}", metadata.flow_id);
    println!(
        "status: {}",
        if context.is_suspended() {
            "suspended"
        } else {
            "completed"
        }
    );
    if let Some(checkpoint_id) = context.get(CHECKPOINT_ID_KEY).and_then(Value::as_str) {
        println!("checkpoint_id: {checkpoint_id}");
    }
    println!("completed_nodes: {}", metadata.completed_nodes.join(", "));
    if !metadata.skipped_components.is_empty() {
        println!("skipped: {}", metadata.skipped_components.join(", "));
    }
    for error in &metadata.errors {
        println!("error: {} [{}] {}", error.component, error.error_type, error.message);
    }
    match serde_json::to_string(&context.data) {
        Ok(data) => println!("data: {data}"),
        Err(error) => println!("data: <unserializable: {error}>"),
    }
}
