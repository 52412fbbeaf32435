use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use sweepflow_engine::{IterableExpander, WorkflowParser};

/// Validate a workflow YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Also print nodes in execution order
    #[arg(long)]
    pub order: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let workflow_path = &args.workflow;

    if !workflow_path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", workflow_path.display());
    }

    output::status("Validating", &format!("{}", workflow_path.display()));

    // Step 1: YAML syntax and shape
    let file = match WorkflowParser::from_file(workflow_path) {
        Ok(f) => f,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };
    output::check("YAML syntax valid");

    // Step 2: steps, bindings and slot types
    let definition = match file.build() {
        Ok(d) => d,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };
    output::check(&format!(
        "Structure: {} steps, {} nodes, {} sweep(s)",
        definition.registry.len(),
        definition.graph.len(),
        definition.graph.sweeps().len()
    ));

    // Step 3: references, cycles and required inputs
    if let Err(e) = definition.graph.validate() {
        output::error(&format!("Graph validation failed: {}", e));
        std::process::exit(1);
    }
    output::check("Graph is acyclic and fully bound");

    output::check(&format!(
        "Expands to {} instance(s)",
        IterableExpander::count(&definition.graph)
    ));

    if let Some(plan) = &definition.sink {
        output::check(&format!(
            "Sink: {} output(s) into {}",
            plan.mappings.len(),
            plan.sink.base_dir().display()
        ));
    }

    if args.order {
        println!();
        for (i, node) in definition.graph.topological_order().iter().enumerate() {
            let deps = definition.graph.dependencies(node.id());
            if deps.is_empty() {
                println!("  {:>3}. {} ({})", i + 1, node.id(), node.step().name());
            } else {
                println!(
                    "  {:>3}. {} ({}) <- {}",
                    i + 1,
                    node.id(),
                    node.step().name(),
                    deps.join(", ")
                );
            }
        }
    }

    println!();
    output::success(&format!("Workflow '{}' is valid", definition.name));

    Ok(())
}
