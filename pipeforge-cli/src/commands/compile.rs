use crate::commands::{load_pipeline, parse_params, report_engine_error, Context};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use pipeline_engine::{RunId, RunOptions, RuntimeTarget};

/// Compile a pipeline into its runtime artifact
#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Path to the pipeline file
    pub pipeline: PathBuf,

    /// Target runtime (default: the document's runtime)
    #[arg(long, short = 'r', value_name = "RUNTIME")]
    pub runtime: Option<RuntimeTarget>,

    /// Override a pipeline parameter (can be repeated, format: name=value)
    #[arg(long = "param", short = 'p', value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Run id baked into the artifact (default: generated)
    #[arg(long, value_name = "ID")]
    pub run_id: Option<String>,

    /// Directory the artifact is written to
    #[arg(long, short = 'o', value_name = "DIR", default_value = ".")]
    pub output: PathBuf,

    /// Print the artifact to stdout instead of writing a file
    #[arg(long)]
    pub stdout: bool,
}

pub fn execute(args: CompileArgs, ctx: &Context) -> Result<()> {
    let pipeline = load_pipeline(&args.pipeline, args.runtime)?;

    let mut options = RunOptions::default();
    options.overrides = parse_params(&args.params)?;
    if let Some(run_id) = &args.run_id {
        options = options.with_run_id(RunId::new(run_id.as_str()));
    }

    output::status(
        "Compiling",
        &format!("'{}' for {}", pipeline.name, pipeline.runtime),
    );
    let engine = ctx.engine_for(&args.pipeline);
    let compiled = engine
        .compile(&pipeline, &options)
        .map_err(report_engine_error)?;
    let rendered = compiled
        .artifact
        .render()
        .map_err(|e| eyre!("Failed to render artifact: {}", e))?;

    if args.stdout {
        print!("{}", rendered);
        return Ok(());
    }

    std::fs::create_dir_all(&args.output)?;
    let path = args.output.join(compiled.artifact.file_name());
    std::fs::write(&path, rendered)?;

    output::check(&format!(
        "{} nodes in {} group(s)",
        compiled.plan.node_count(),
        compiled.plan.len()
    ));
    output::success(&format!("Wrote {}", path.display()));

    Ok(())
}
