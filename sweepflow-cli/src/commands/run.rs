use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use sweepflow_engine::execution::LogLevel;
use sweepflow_engine::{
    progress_channel, ContentCache, ExecutionEvent, ExecutorConfig, RunOutcome, WorkflowExecutor,
    WorkflowParser,
};

/// Run a workflow: every instance, every node, reusing cached results
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Maximum number of actions running at once (default: available cores)
    #[arg(long, short = 'j', value_name = "N")]
    pub workers: Option<usize>,

    /// Result cache directory (default: ~/.sweepflow/cache)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Place sink outputs under this directory instead of the workflow's
    #[arg(long, value_name = "DIR")]
    pub sink_dir: Option<PathBuf>,

    /// Stop scheduling new work after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Re-run every node, replacing cached results
    #[arg(long)]
    pub no_cache: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let workflow_path = &args.workflow;

    if !workflow_path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", workflow_path.display());
    }

    output::status("Parsing", &format!("{}", workflow_path.display()));

    let definition = match WorkflowParser::load(workflow_path) {
        Ok(d) => d,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    let cache = match &args.cache_dir {
        Some(dir) => ContentCache::with_cache_dir(dir),
        None => ContentCache::new(),
    };
    tracing::debug!(cache_dir = %cache.cache_dir().display(), "using result cache");

    let mut config = ExecutorConfig::default()
        .with_fail_fast(args.fail_fast)
        .with_cache(!args.no_cache);
    if let Some(workers) = args.workers {
        config = config.with_max_workers(workers);
    }

    let executor = match WorkflowExecutor::from_graph(&definition.graph, Arc::new(cache)) {
        Ok(e) => e,
        Err(e) => {
            output::error(&format!("Invalid workflow: {}", e));
            std::process::exit(1);
        }
    };

    let (tx, mut rx) = progress_channel();
    let executor = executor.with_config(config).with_progress(tx);

    // Ctrl-C cancels; running actions are aborted and the rest skipped
    let cancel = executor.cancel_handle();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let exec_handle = tokio::spawn(async move { executor.execute().await });

    // Render progress until the executor drops its sender
    while let Some(event) = rx.recv().await {
        match &event {
            ExecutionEvent::RunStarted {
                workflow,
                total_instances,
                total_nodes,
            } => {
                output::header(&format!(
                    "Workflow '{}': {} instance(s), {} node(s)",
                    workflow, total_instances, total_nodes
                ));
            }

            ExecutionEvent::RunCompleted { .. } => {}

            ExecutionEvent::NodeStarted { instance, node_id } => {
                output::status("Running", &node_label(instance, node_id));
            }

            ExecutionEvent::NodeCached {
                instance,
                node_id,
                key,
            } => {
                output::dim(&format!(
                    "      Cached {} [{}]",
                    node_label(instance, node_id),
                    &key[..key.len().min(12)]
                ));
            }

            ExecutionEvent::NodeCompleted {
                instance,
                node_id,
                duration,
            } => {
                output::dim_success(&format!(
                    "    {} OK ({:.2}s)",
                    node_label(instance, node_id),
                    duration.as_secs_f64()
                ));
            }

            ExecutionEvent::NodeFailed {
                instance,
                node_id,
                failure,
                duration,
            } => {
                let exit_info = match failure.exit_code {
                    Some(code) => format!(" (exit code: {})", code),
                    None => String::new(),
                };
                output::dim_failure(&format!(
                    "    {} FAIL ({:.2}s){}: {}",
                    node_label(instance, node_id),
                    duration.as_secs_f64(),
                    exit_info,
                    failure.message
                ));
                if let Some(details) = &failure.details {
                    for line in details.lines() {
                        output::detail(line);
                    }
                }
            }

            ExecutionEvent::NodeSkipped {
                instance,
                node_id,
                reason,
            } => {
                output::warning(&format!(
                    "{} skipped: {}",
                    node_label(instance, node_id),
                    reason
                ));
            }

            ExecutionEvent::Log { level, message, .. } => match level {
                LogLevel::Error => output::error(message),
                LogLevel::Warning => output::warning(message),
                _ => output::dim(message),
            },
        }
    }

    let result = exec_handle.await?;
    signal_handle.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            output::error(&format!("Run aborted: {}", e));
            std::process::exit(1);
        }
    };

    // Missing outputs of failed instances are reported, not fatal to the rest
    let mut sink_failures = 0;
    if let Some(plan) = &definition.sink {
        let sink = match &args.sink_dir {
            Some(dir) => plan.sink.clone().with_base_dir(dir),
            None => plan.sink.clone(),
        };
        output::status("Collecting", &format!("{}", sink.base_dir().display()));

        for instance in &report.instances {
            let collected = sink.collect(instance, &plan.mappings);
            for (mapping, err) in &collected.failures {
                output::failure(&format!(
                    "[{}] {} -> {}: {}",
                    instance.label(),
                    mapping.source,
                    mapping.template,
                    err
                ));
            }
            sink_failures += collected.failures.len();
            if !collected.placed.is_empty() {
                output::dim(&format!(
                    "      [{}] placed {} output(s)",
                    instance.label(),
                    collected.placed.len()
                ));
            }
        }
    }

    println!();
    let summary = format!(
        "{} executed, {} cached, {} failed, {} skipped in {:.2}s",
        report.executed_count(),
        report.cached_count(),
        report.count(sweepflow_engine::NodeStatus::Failed),
        report.count(sweepflow_engine::NodeStatus::Skipped),
        report.duration.as_secs_f64()
    );

    if report.cancelled {
        output::failure(&format!("Workflow cancelled: {}", summary));
        std::process::exit(130);
    }

    match report.outcome() {
        RunOutcome::Success if sink_failures == 0 => {
            output::success(&format!("Workflow succeeded: {}", summary));
        }
        RunOutcome::Success => {
            output::failure(&format!(
                "Workflow succeeded but {} output(s) could not be placed: {}",
                sink_failures, summary
            ));
            std::process::exit(1);
        }
        RunOutcome::PartialFailure { failed } => {
            output::failure(&format!("Workflow failed: {}", summary));
            for node in &failed {
                output::error(&format!(
                    "  - {}: {}",
                    node_label(&node.instance, &node.node_id),
                    node.failure.message
                ));
            }
            std::process::exit(1);
        }
    }

    Ok(())
}

/// "instance/node", or just the node for a workflow without sweeps
fn node_label(instance: &str, node_id: &str) -> String {
    if instance.is_empty() || instance == "_" {
        node_id.to_string()
    } else {
        format!("{}/{}", instance, node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_label() {
        assert_eq!(node_label("_", "design"), "design");
        assert_eq!(node_label("subject=B", "design"), "subject=B/design");
    }
}
