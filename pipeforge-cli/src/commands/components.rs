use crate::commands::Context;
use crate::output;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{generic_components, Capabilities, ComponentProvider, RuntimeTarget};

/// List generic node types and catalog components
#[derive(Args, Debug)]
pub struct ComponentsArgs {
    /// Show inputs and outputs of each custom component
    #[arg(long, short = 'd')]
    pub details: bool,
}

pub fn execute(args: ComponentsArgs, ctx: &Context) -> Result<()> {
    output::header("Generic nodes");
    for component in generic_components() {
        println!(
            "  {:<16} {} (.{})",
            component.kind.as_str(),
            component.description,
            component.extensions.join(", .")
        );
    }

    println!();
    output::header("Runtimes");
    for runtime in [RuntimeTarget::Local, RuntimeTarget::Kfp, RuntimeTarget::Airflow] {
        let supported: Vec<&str> = Capabilities::for_runtime(runtime)
            .describe()
            .into_iter()
            .filter(|(_, yes)| *yes)
            .map(|(feature, _)| feature)
            .collect();
        let supported = if supported.is_empty() {
            "generic nodes only".to_string()
        } else {
            supported.join(", ")
        };
        println!("  {:<16} {}", runtime.as_str(), supported);
    }

    println!();
    output::header("Custom components");
    let components = ctx.catalog.components();
    if components.is_empty() {
        output::dim("  No catalog loaded (use --catalog <FILE>)");
        return Ok(());
    }

    for spec in &components {
        println!("  {:<16} {}", spec.id, spec.name);
        if !spec.description.is_empty() {
            output::dim(&format!("      {}", spec.description));
        }
        if args.details {
            output::dim(&format!("      image: {}", spec.image));
            for input in &spec.inputs {
                let required = if input.required { " (required)" } else { "" };
                output::dim(&format!(
                    "      in  {}: {}{}",
                    input.key, input.type_name, required
                ));
            }
            for out in &spec.outputs {
                output::dim(&format!("      out {}", out.key));
            }
        }
    }
    println!();
    output::dim(&format!("  {} component(s) total", components.len()));

    Ok(())
}
