use crate::commands::{load_pipeline, parse_params, pipeline_dir, report_engine_error, Context};
use crate::output;

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use pipeline_engine::execution::LogLevel;
use pipeline_engine::{
    event_stream, progress_channel, stage_sources, ExecutionEvent, MonitorOptions, NodeState, RunId,
    RunOptions, RunSnapshot, RunState, RuntimeTarget,
};

/// Run a pipeline and follow it until it finishes
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline file
    pub pipeline: PathBuf,

    /// Target runtime (default: the document's runtime)
    #[arg(long, short = 'r', value_name = "RUNTIME")]
    pub runtime: Option<RuntimeTarget>,

    /// Override a pipeline parameter (can be repeated, format: name=value)
    #[arg(long = "param", short = 'p', value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Run id (default: generated from the pipeline name)
    #[arg(long, value_name = "ID")]
    pub run_id: Option<String>,

    /// Give up and stop the run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Status poll interval in milliseconds
    #[arg(long, value_name = "MS")]
    pub poll_interval: Option<u64>,

    /// Skip copying sources into the staging root for container runtimes
    #[arg(long)]
    pub no_stage: bool,
}

pub async fn execute(args: RunArgs, ctx: &Context) -> Result<()> {
    let pipeline = load_pipeline(&args.pipeline, args.runtime)?;

    let mut options = RunOptions::default();
    options.overrides = parse_params(&args.params)?;
    if let Some(run_id) = &args.run_id {
        options = options.with_run_id(RunId::new(run_id.as_str()));
    }

    let mut monitor = MonitorOptions::from_config(&ctx.config.monitor);
    if let Some(ms) = args.poll_interval {
        monitor = MonitorOptions::new(Duration::from_millis(ms)).with_timeout(monitor.timeout);
    }
    if let Some(secs) = args.timeout {
        monitor = monitor.with_timeout(Some(Duration::from_secs(secs)));
    }

    // Compile
    output::status("Compiling", &format!("'{}' for {}", pipeline.name, pipeline.runtime));
    let engine = ctx.engine_for(&args.pipeline);
    let compiled = engine
        .compile(&pipeline, &options)
        .map_err(report_engine_error)?;

    if pipeline.runtime != RuntimeTarget::Local && !args.no_stage {
        let staged = stage_sources(&compiled.resolved, &pipeline_dir(&args.pipeline))
            .map_err(|e| eyre!("Failed to stage sources: {}", e))?;
        if !staged.is_empty() {
            output::info(&format!(
                "Staged {} file(s) under {}",
                staged.len(),
                compiled.resolved.run_dir()
            ));
        }
    }

    // Progress is printed from a background task until the dispatcher drops its sender
    let (tx, rx) = progress_channel();
    let dispatcher = engine.dispatcher().with_progress(tx);
    let printer = tokio::spawn(async move {
        let mut events = event_stream(rx);
        while let Some(event) = events.next().await {
            print_event(&event);
        }
    });

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling run...");
            ctrl_c.cancel();
        }
    });

    let result = match dispatcher.submit(&compiled.artifact).await {
        Ok(run_id) => dispatcher.monitor(&run_id, monitor, token).await,
        Err(e) => Err(e),
    };
    drop(dispatcher);
    printer.await?;

    let snapshot = result.map_err(|e| eyre!(e))?;
    print_summary(&snapshot);

    if snapshot.state != RunState::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunSubmitted {
            run_id,
            pipeline_name,
            runtime,
            total_nodes,
        } => {
            println!();
            output::header(&format!(
                "Run '{}' of '{}' on {} ({} nodes)",
                run_id, pipeline_name, runtime, total_nodes
            ));
        }

        ExecutionEvent::RunStateChanged { state, error, .. } => match error {
            Some(error) => output::dim(&format!("  run {}: {}", state, error)),
            None => output::dim(&format!("  run {}", state)),
        },

        ExecutionEvent::NodeStateChanged {
            node_id,
            state,
            attempts,
            message,
            ..
        } => output::node_state(node_id, *state, *attempts, message.as_deref()),

        ExecutionEvent::Log {
            level,
            message,
            node_id,
            ..
        } => {
            let message = match node_id {
                Some(node) => format!("{}: {}", node, message),
                None => message.clone(),
            };
            match level {
                LogLevel::Error => output::error(&message),
                LogLevel::Warning => output::warning(&message),
                _ => output::dim(&message),
            }
        }
    }
}

fn print_summary(snapshot: &RunSnapshot) {
    println!();
    let elapsed = match (snapshot.submitted_at, snapshot.finished_at) {
        (Some(start), Some(end)) => format!(" in {:.2}s", (end - start).num_milliseconds() as f64 / 1000.0),
        _ => String::new(),
    };
    let counts = format!(
        "{} succeeded, {} failed, {} skipped",
        snapshot.count(NodeState::Succeeded),
        snapshot.count(NodeState::Failed),
        snapshot.count(NodeState::Skipped)
    );

    match snapshot.state {
        RunState::Succeeded => output::success(&format!("Run {} succeeded{} ({})", snapshot.run_id, elapsed, counts)),
        state => {
            output::failure(&format!("Run {} {}{} ({})", snapshot.run_id, state, elapsed, counts));
            if let Some(error) = &snapshot.error {
                output::error(&error.to_string());
            }
            for (id, node) in &snapshot.nodes {
                if node.state == NodeState::Failed {
                    if let Some(log) = &node.log_ref {
                        output::info(&format!("{} log: {}", id, log));
                    }
                }
            }
        }
    }
}
