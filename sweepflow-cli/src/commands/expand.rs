use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use sweepflow_engine::{IterableExpander, WorkflowParser};

/// List the instances a workflow expands to
#[derive(Args, Debug)]
pub struct ExpandArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Print the swept value of every slot, one per line
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

pub fn execute(args: ExpandArgs) -> Result<()> {
    let workflow_path = &args.workflow;

    if !workflow_path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", workflow_path.display());
    }

    let definition = match WorkflowParser::load(workflow_path) {
        Ok(d) => d,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    let instances = match IterableExpander::expand(&definition.graph) {
        Ok(instances) => instances,
        Err(e) => {
            output::error(&format!("Invalid workflow: {}", e));
            std::process::exit(1);
        }
    };

    output::status(
        "Expanding",
        &format!("'{}' into {} instance(s)", definition.name, instances.len()),
    );

    for instance in instances {
        println!("{:>4}  {}", instance.index, instance.key.label());
        if args.verbose {
            for entry in instance.key.entries() {
                output::dim(&format!("        {}.{} = {}", entry.node, entry.slot, entry.value));
            }
        }
    }

    Ok(())
}
