use crate::commands::{load_pipeline, report_engine_error, Context};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{RunOptions, RuntimeTarget};

/// Validate a pipeline document
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline file (.json, .yaml or .pipeline)
    pub pipeline: PathBuf,

    /// Validate against this runtime instead of the one in the document
    #[arg(long, short = 'r', value_name = "RUNTIME")]
    pub runtime: Option<RuntimeTarget>,

    /// Also print the execution order
    #[arg(long)]
    pub order: bool,
}

pub fn execute(args: ValidateArgs, ctx: &Context) -> Result<()> {
    output::status("Validating", &format!("{}", args.pipeline.display()));

    let pipeline = load_pipeline(&args.pipeline, args.runtime)?;
    output::check("Document parsed");
    output::check(&format!(
        "Structure: {} nodes, {} edges, {} parameters",
        pipeline.nodes.len(),
        pipeline.edges.len(),
        pipeline.parameters.len()
    ));

    let engine = ctx.engine_for(&args.pipeline);
    let result = engine.validate(&pipeline);
    output::violations(&result.violations);
    if !result.is_valid() {
        std::process::exit(1);
    }
    output::check(&format!("Runtime '{}' supports every node", pipeline.runtime));

    if args.order {
        let (plan, _) = engine
            .resolve(&pipeline, &RunOptions::default())
            .map_err(report_engine_error)?;
        println!();
        for (index, group) in plan.groups().iter().enumerate() {
            println!("  {:>3}. {}", index + 1, group.join(", "));
        }
    }

    println!();
    output::success("Pipeline is valid");

    Ok(())
}
