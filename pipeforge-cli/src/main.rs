mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::{compile, components, run, validate, Context};

/// Validate, compile and run notebook and script pipelines
#[derive(Parser, Debug)]
#[command(name = "pipeforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine config file (default: <config dir>/pipeforge/config.yaml)
    #[arg(long, global = true, value_name = "FILE", env = "PIPEFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Component catalog file for custom component nodes
    #[arg(long, global = true, value_name = "FILE", env = "PIPEFORGE_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check a pipeline for structural and runtime problems
    Validate(validate::ValidateArgs),

    /// Write the runtime artifact for a pipeline without running it
    Compile(compile::CompileArgs),

    /// Compile a pipeline, submit it and follow it to completion
    Run(run::RunArgs),

    /// List the node types available to pipelines
    Components(components::ComponentsArgs),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "pipeforge=warn,pipeline_engine=warn",
        1 => "pipeforge=debug,pipeline_engine=debug,info",
        _ => "pipeforge=trace,pipeline_engine=trace,debug",
    };
    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let ctx = Context::load(cli.config.as_deref(), cli.catalog.as_deref())?;

    match cli.command {
        Commands::Validate(args) => validate::execute(args, &ctx),
        Commands::Compile(args) => compile::execute(args, &ctx),
        Commands::Run(args) => run::execute(args, &ctx).await,
        Commands::Components(args) => components::execute(args, &ctx),
    }
}
