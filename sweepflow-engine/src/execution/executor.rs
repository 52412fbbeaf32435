// Workflow Executor
// Schedules expanded instances on a bounded worker pool, consulting the cache before every node

use crate::cache::key::{compute_key, CacheKey, KeyInput};
use crate::cache::store::{CacheError, ContentCache, Lookup};
use crate::error::{EngineError, EngineResult};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::expand::{ExpandedInstance, IterableExpander};
use crate::execution::graph::{Binding, GraphError, WorkflowGraph};
use crate::execution::record::{ExecutionRecord, NodeStatus, SkipReason};
use crate::execution::report::{InstanceReport, RunReport};
use crate::step::descriptor::ActionContext;
use crate::step::models::{Failure, Inputs, Outputs};

use futures::future::join_all;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Configuration for workflow execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of actions running at once (at least 1)
    pub max_workers: usize,
    /// Cancel the rest of the run after the first failure
    pub fail_fast: bool,
    /// Consult the cache before running a node. When disabled, every node
    /// runs and replaces any previously stored result.
    pub use_cache: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            fail_fast: false,
            use_cache: true,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }
}

/// Handle for cancelling a running execution from another task
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Workflow executor
pub struct WorkflowExecutor {
    workflow: String,
    instances: Vec<ExpandedInstance>,
    cache: Arc<ContentCache>,
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl WorkflowExecutor {
    /// Validate and expand a graph, then build an executor over its instances
    pub fn from_graph(graph: &WorkflowGraph, cache: Arc<ContentCache>) -> Result<Self, GraphError> {
        let instances = IterableExpander::expand(graph)?.collect();
        Ok(Self::new(graph.name(), instances, cache))
    }

    /// Create an executor over already expanded instances
    pub fn new(
        workflow: impl Into<String>,
        instances: Vec<ExpandedInstance>,
        cache: Arc<ContentCache>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            workflow: workflow.into(),
            instances,
            cache,
            config: ExecutorConfig::default(),
            event_tx: None,
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    /// Set executor configuration
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    pub fn instances(&self) -> &[ExpandedInstance] {
        &self.instances
    }

    /// Execute every instance until all records are terminal.
    ///
    /// Node failures are reported in the returned `RunReport`. Only graph
    /// errors and cache corruption end the run with an error.
    #[tracing::instrument(skip(self), fields(workflow = %self.workflow))]
    pub async fn execute(&self) -> EngineResult<RunReport> {
        for instance in &self.instances {
            instance.graph.validate()?;
        }

        let start = Instant::now();
        let mut run = Run::new(self);

        self.event_tx.send_event(ExecutionEvent::run_started(
            &self.workflow,
            self.instances.len(),
            run.total_nodes(),
        ));
        info!(
            instances = self.instances.len(),
            workers = self.config.max_workers.max(1),
            "starting run"
        );

        if let Err(e) = run.drive().await {
            run.abort_outstanding().await;
            return Err(e);
        }

        let duration = start.elapsed();
        let report = run.into_report(duration);

        self.event_tx.send_event(ExecutionEvent::run_completed(
            &self.workflow,
            report.success(),
            duration,
        ));
        info!(
            executed = report.executed_count(),
            cached = report.cached_count(),
            success = report.success(),
            "run finished"
        );

        Ok(report)
    }
}

/// A node within one expanded instance, ordered by (instance, declaration)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct NodeInstanceId {
    instance: usize,
    node: usize,
}

type ActionResult = (NodeInstanceId, Result<Outputs, Failure>);

struct InstanceState<'a> {
    graph: &'a WorkflowGraph,
    label: String,
    dependents: Vec<Vec<usize>>,
    remaining: Vec<usize>,
    records: Vec<ExecutionRecord>,
}

/// Mutable scheduler state of one execution, owned by the scheduler task
struct Run<'a> {
    executor: &'a WorkflowExecutor,
    instances: Vec<InstanceState<'a>>,
    ready: BTreeSet<NodeInstanceId>,
    runnable: BTreeSet<NodeInstanceId>,
    inputs: HashMap<NodeInstanceId, Inputs>,
    /// Key of each action in flight, mapped to the node running it
    in_flight: HashMap<CacheKey, NodeInstanceId>,
    /// Nodes sharing the result of an in-flight action
    waiters: HashMap<NodeInstanceId, Vec<NodeInstanceId>>,
    /// Results published during this run
    produced: HashMap<CacheKey, Outputs>,
    staging: HashMap<NodeInstanceId, TempDir>,
    started: HashMap<NodeInstanceId, Instant>,
    join_set: JoinSet<ActionResult>,
    dispatch_order: Vec<(usize, String)>,
    cancelled: bool,
}

impl<'a> Run<'a> {
    fn new(executor: &'a WorkflowExecutor) -> Self {
        let mut ready = BTreeSet::new();
        let instances = executor
            .instances
            .iter()
            .enumerate()
            .map(|(i, instance)| {
                let graph = &instance.graph;
                let remaining: Vec<usize> =
                    graph.dependencies_table().iter().map(Vec::len).collect();
                let mut records: Vec<ExecutionRecord> = graph
                    .nodes()
                    .iter()
                    .map(|n| ExecutionRecord::new(n.id(), n.step().name()))
                    .collect();
                for (node, &count) in remaining.iter().enumerate() {
                    if count == 0 {
                        records[node].status = NodeStatus::Ready;
                        ready.insert(NodeInstanceId { instance: i, node });
                    }
                }
                InstanceState {
                    graph,
                    label: instance.key.label(),
                    dependents: graph.dependents_table(),
                    remaining,
                    records,
                }
            })
            .collect();

        Self {
            executor,
            instances,
            ready,
            runnable: BTreeSet::new(),
            inputs: HashMap::new(),
            in_flight: HashMap::new(),
            waiters: HashMap::new(),
            produced: HashMap::new(),
            staging: HashMap::new(),
            started: HashMap::new(),
            join_set: JoinSet::new(),
            dispatch_order: Vec::new(),
            cancelled: false,
        }
    }

    fn total_nodes(&self) -> usize {
        self.instances.iter().map(|i| i.records.len()).sum()
    }

    fn graph(&self, instance: usize) -> &'a WorkflowGraph {
        self.instances[instance].graph
    }

    fn record_mut(&mut self, id: NodeInstanceId) -> &mut ExecutionRecord {
        &mut self.instances[id.instance].records[id.node]
    }

    fn record(&self, id: NodeInstanceId) -> &ExecutionRecord {
        &self.instances[id.instance].records[id.node]
    }

    fn label(&self, id: NodeInstanceId) -> String {
        self.instances[id.instance].label.clone()
    }

    fn node_id(&self, id: NodeInstanceId) -> String {
        self.record(id).node_id.clone()
    }

    /// Scheduler loop; returns once every record is terminal
    async fn drive(&mut self) -> EngineResult<()> {
        let mut cancel_rx = self.executor.cancel_tx.subscribe();
        let workers = self.executor.config.max_workers.max(1);

        loop {
            if *cancel_rx.borrow_and_update() {
                self.cancel().await;
                break;
            }

            self.evaluate_ready().await?;

            while self.join_set.len() < workers {
                let Some(id) = self.runnable.pop_first() else {
                    break;
                };
                self.dispatch(id);
            }

            // sharing a result may have made more nodes ready
            if !self.ready.is_empty() {
                continue;
            }
            if self.join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel_rx.changed() => continue,
                joined = self.join_set.join_next() => match joined {
                    Some(Ok((id, result))) => self.complete(id, result).await?,
                    Some(Err(e)) => warn!(error = %e, "worker task ended without a result"),
                    None => {}
                },
            }
        }

        self.finalize_leftovers();
        Ok(())
    }

    /// Compute keys for newly ready nodes and consult the cache.
    ///
    /// Keys hash input files, so each batch is digested concurrently on the
    /// blocking pool; results are then applied in node order.
    async fn evaluate_ready(&mut self) -> EngineResult<()> {
        while !self.ready.is_empty() {
            let batch = std::mem::take(&mut self.ready);

            let mut resolved = Vec::with_capacity(batch.len());
            let mut pending = Vec::with_capacity(batch.len());
            for id in batch {
                match self.resolve_inputs(id) {
                    Ok((inputs, key_inputs)) => {
                        let step = Arc::clone(self.graph(id.instance).nodes()[id.node].step());
                        pending.push(compute_key(step, key_inputs));
                        resolved.push((id, inputs));
                    }
                    Err(failure) => self.fail(id, failure, Duration::ZERO),
                }
            }
            let keys = join_all(pending).await;

            for ((id, inputs), key) in resolved.into_iter().zip(keys) {
                let key = match key {
                    Ok(key) => key,
                    Err(e) => {
                        let failure = Failure::new(format!("cannot compute cache key: {}", e));
                        self.fail(id, failure, Duration::ZERO);
                        continue;
                    }
                };
                self.record_mut(id).cache_key = Some(key.clone());

                let executor = self.executor;
                if executor.config.use_cache {
                    if let Lookup::Hit(entry) = executor.cache.lookup(&key).await? {
                        debug!(node = %self.node_id(id), key = %key.short(), "cache hit");
                        self.executor.event_tx.send_event(ExecutionEvent::node_cached(
                            self.label(id),
                            self.node_id(id),
                            key.short(),
                        ));
                        self.mark_done(id, entry.outputs, true, Duration::ZERO);
                        continue;
                    }
                }

                self.inputs.insert(id, inputs);
                self.runnable.insert(id);
            }
        }
        Ok(())
    }

    /// Realize inputs from bindings, defaults and upstream outputs
    fn resolve_inputs(
        &self,
        id: NodeInstanceId,
    ) -> Result<(Inputs, BTreeMap<String, KeyInput>), Failure> {
        let state = &self.instances[id.instance];
        let node = &state.graph.nodes()[id.node];
        let mut inputs = Inputs::new();
        let mut key_inputs = BTreeMap::new();

        for (slot, spec) in node.step().inputs() {
            match node.binding(slot) {
                Some(Binding::Literal(value)) => {
                    inputs.insert(slot.clone(), value.clone());
                    key_inputs.insert(slot.clone(), KeyInput::Literal(value.clone()));
                }
                Some(Binding::Output(reference)) => {
                    let producer = state.graph.index_of(&reference.node).ok_or_else(|| {
                        Failure::new(format!("producer '{}' is not in the graph", reference.node))
                    })?;
                    let record = &state.records[producer];
                    let value = record
                        .outputs
                        .as_ref()
                        .and_then(|o| o.get(&reference.slot))
                        .ok_or_else(|| {
                            Failure::new(format!("upstream output '{}' is missing", reference))
                        })?;
                    let value = value.coerce_to(&spec.ty).ok_or_else(|| {
                        Failure::new(format!(
                            "upstream output '{}' does not conform to {}",
                            reference, spec.ty
                        ))
                    })?;
                    let producer_key = record.cache_key.clone().ok_or_else(|| {
                        Failure::new(format!("producer '{}' has no cache key", reference.node))
                    })?;
                    inputs.insert(slot.clone(), value);
                    key_inputs.insert(
                        slot.clone(),
                        KeyInput::Upstream {
                            producer_key,
                            slot: reference.slot.clone(),
                        },
                    );
                }
                None => {
                    if let Some(default) = &spec.default {
                        inputs.insert(slot.clone(), default.clone());
                        key_inputs.insert(slot.clone(), KeyInput::Literal(default.clone()));
                    }
                }
            }
        }

        Ok((inputs, key_inputs))
    }

    /// Start an action, or attach to an identical one already running
    fn dispatch(&mut self, id: NodeInstanceId) {
        let Some(key) = self.record(id).cache_key.clone() else {
            return;
        };

        if let Some(outputs) = self.produced.get(&key).cloned() {
            self.inputs.remove(&id);
            self.mark_done(id, outputs, true, Duration::ZERO);
            return;
        }
        if let Some(&leader) = self.in_flight.get(&key) {
            debug!(node = %self.node_id(id), leader = %self.node_id(leader), "sharing in-flight result");
            self.inputs.remove(&id);
            self.waiters.entry(leader).or_default().push(id);
            return;
        }

        let staging = match self.executor.cache.staging_dir() {
            Ok(dir) => dir,
            Err(e) => {
                self.inputs.remove(&id);
                let failure = Failure::new(format!("cannot create staging directory: {}", e));
                self.fail(id, failure, Duration::ZERO);
                return;
            }
        };

        let inputs = self.inputs.remove(&id).unwrap_or_default();
        let ctx = ActionContext {
            node_id: self.node_id(id),
            instance: self.label(id),
            work_dir: staging.path().to_path_buf(),
        };
        let action = self.graph(id.instance).nodes()[id.node].step().action();

        self.record_mut(id).status = NodeStatus::Running;
        self.dispatch_order.push((id.instance, ctx.node_id.clone()));
        self.executor
            .event_tx
            .send_event(ExecutionEvent::node_started(&ctx.instance, &ctx.node_id));
        debug!(node = %ctx.node_id, instance = %ctx.instance, key = %key.short(), "dispatching");

        self.in_flight.insert(key, id);
        self.staging.insert(id, staging);
        self.started.insert(id, Instant::now());

        self.join_set.spawn(async move {
            let result = AssertUnwindSafe(action.run(&inputs, &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Failure::new("action panicked")));
            (id, result)
        });
    }

    /// Handle a finished action
    async fn complete(
        &mut self,
        id: NodeInstanceId,
        result: Result<Outputs, Failure>,
    ) -> EngineResult<()> {
        let duration = self
            .started
            .remove(&id)
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let staging = self.staging.remove(&id);
        let Some(key) = self.record(id).cache_key.clone() else {
            return Ok(());
        };
        self.in_flight.remove(&key);

        let outputs = result.and_then(|outputs| self.check_outputs(id, outputs));
        let (outputs, staging) = match (outputs, staging) {
            (Ok(outputs), Some(staging)) => (outputs, staging),
            (Ok(_), None) => {
                self.fail(id, Failure::new("staging directory was lost"), duration);
                return Ok(());
            }
            (Err(failure), _) => {
                self.fail(id, failure, duration);
                return Ok(());
            }
        };

        let executor = self.executor;
        if !executor.config.use_cache {
            executor.cache.remove(&key).await.map_err(EngineError::from)?;
        }
        let step = self.graph(id.instance).nodes()[id.node].step();
        match executor.cache.publish(&key, step, staging, outputs).await {
            Ok(entry) => {
                self.executor.event_tx.send_event(ExecutionEvent::node_completed(
                    self.label(id),
                    self.node_id(id),
                    duration,
                ));
                self.produced.insert(key, entry.outputs.clone());
                self.mark_done(id, entry.outputs, false, duration);
                Ok(())
            }
            Err(e @ CacheError::Corruption { .. }) => Err(e.into()),
            Err(e) => {
                let failure = Failure::new(format!("failed to publish result: {}", e));
                self.fail(id, failure, duration);
                Ok(())
            }
        }
    }

    /// Every declared output present and well typed; undeclared ones dropped
    fn check_outputs(&self, id: NodeInstanceId, outputs: Outputs) -> Result<Outputs, Failure> {
        let step = self.graph(id.instance).nodes()[id.node].step();
        let mut checked = Outputs::new();

        for (slot, value) in outputs {
            let Some(spec) = step.output_spec(&slot) else {
                warn!(node = %self.node_id(id), slot = %slot, "dropping undeclared output");
                self.executor.event_tx.send_event(ExecutionEvent::warning(
                    format!("dropping undeclared output '{}'", slot),
                    Some(self.node_id(id)),
                ));
                continue;
            };
            let value = value.coerce_to(&spec.ty).ok_or_else(|| {
                Failure::new(format!("output '{}' does not conform to {}", slot, spec.ty))
            })?;
            if let Some(missing) = value.paths().into_iter().find(|p| !p.exists()) {
                return Err(Failure::new(format!(
                    "output '{}' points at missing path {}",
                    slot,
                    missing.display()
                )));
            }
            checked.insert(slot, value);
        }

        if let Some(slot) = step.outputs().keys().find(|s| !checked.contains_key(*s)) {
            return Err(Failure::new(format!(
                "action did not produce declared output '{}'",
                slot
            )));
        }

        Ok(checked)
    }

    /// Mark a node done and release its dependents and waiters
    fn mark_done(&mut self, id: NodeInstanceId, outputs: Outputs, cached: bool, duration: Duration) {
        if self.record(id).status.is_terminal() {
            return;
        }
        self.record_mut(id)
            .complete(outputs.clone(), cached, duration);

        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            self.executor.event_tx.send_event(ExecutionEvent::node_cached(
                self.label(waiter),
                self.node_id(waiter),
                self.record(waiter)
                    .cache_key
                    .as_ref()
                    .map(|k| k.short().to_string())
                    .unwrap_or_default(),
            ));
            self.mark_done(waiter, outputs.clone(), true, Duration::ZERO);
        }

        let state = &mut self.instances[id.instance];
        for &dependent in &state.dependents[id.node] {
            state.remaining[dependent] -= 1;
            if state.remaining[dependent] == 0
                && state.records[dependent].status == NodeStatus::Pending
            {
                state.records[dependent].status = NodeStatus::Ready;
                self.ready.insert(NodeInstanceId {
                    instance: id.instance,
                    node: dependent,
                });
            }
        }
    }

    /// Mark a node failed and skip everything downstream of it
    fn fail(&mut self, id: NodeInstanceId, failure: Failure, duration: Duration) {
        if self.record(id).status.is_terminal() {
            return;
        }
        let node_id = self.node_id(id);
        warn!(node = %node_id, instance = %self.label(id), error = %failure, "node failed");
        self.executor.event_tx.send_event(ExecutionEvent::node_failed(
            self.label(id),
            &node_id,
            failure.clone(),
            duration,
        ));
        self.record_mut(id).fail(failure.clone(), duration);
        self.ready.remove(&id);
        self.runnable.remove(&id);

        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            self.fail(waiter, failure.clone(), Duration::ZERO);
        }

        let mut stack = self.instances[id.instance].dependents[id.node].clone();
        while let Some(node) = stack.pop() {
            let dependent = NodeInstanceId {
                instance: id.instance,
                node,
            };
            if self.record(dependent).status.is_terminal() {
                continue;
            }
            self.skip(
                dependent,
                SkipReason::UpstreamFailed {
                    node: node_id.clone(),
                },
            );
            stack.extend(self.instances[id.instance].dependents[node].iter().copied());
        }

        if self.executor.config.fail_fast {
            self.executor.cancel_tx.send_replace(true);
        }
    }

    fn skip(&mut self, id: NodeInstanceId, reason: SkipReason) {
        self.ready.remove(&id);
        self.runnable.remove(&id);
        self.inputs.remove(&id);
        self.executor.event_tx.send_event(ExecutionEvent::node_skipped(
            self.label(id),
            self.node_id(id),
            reason.clone(),
        ));
        self.record_mut(id).skip(reason);
    }

    /// Abort running actions and skip everything not yet started
    async fn cancel(&mut self) {
        info!("cancelling run");
        self.cancelled = true;
        self.abort_outstanding().await;

        let running: Vec<NodeInstanceId> = self.started.keys().copied().collect();
        // running nodes fail; their dependents are skipped as cancelled below
        for id in running {
            let duration = self
                .started
                .remove(&id)
                .map(|t| t.elapsed())
                .unwrap_or_default();
            let failure = Failure::cancelled();
            self.executor.event_tx.send_event(ExecutionEvent::node_failed(
                self.label(id),
                self.node_id(id),
                failure.clone(),
                duration,
            ));
            self.record_mut(id).fail(failure, duration);
        }
        self.waiters.clear();

        for id in self.non_terminal() {
            self.skip(id, SkipReason::Cancelled);
        }
    }

    async fn abort_outstanding(&mut self) {
        self.join_set.abort_all();
        while self.join_set.join_next().await.is_some() {}
        self.staging.clear();
        self.in_flight.clear();
    }

    fn non_terminal(&self) -> Vec<NodeInstanceId> {
        self.instances
            .iter()
            .enumerate()
            .flat_map(|(instance, state)| {
                state
                    .records
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| !r.status.is_terminal())
                    .map(move |(node, _)| NodeInstanceId { instance, node })
            })
            .collect()
    }

    /// Records that can no longer progress (a worker vanished) become failures
    fn finalize_leftovers(&mut self) {
        for id in self.non_terminal() {
            if self.record(id).status.is_terminal() {
                continue;
            }
            self.fail(id, Failure::new("node did not complete"), Duration::ZERO);
        }
    }

    fn into_report(self, duration: Duration) -> RunReport {
        let instances = self
            .instances
            .into_iter()
            .zip(self.executor.instances.iter())
            .map(|(state, instance)| InstanceReport {
                index: instance.index,
                key: instance.key.clone(),
                records: state.records,
            })
            .collect();

        RunReport {
            workflow: self.executor.workflow.clone(),
            instances,
            dispatch_order: self.dispatch_order,
            duration,
            cancelled: self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::report::RunOutcome;
    use crate::step::descriptor::{FnAction, StepAction, StepDescriptor};
    use crate::step::models::{InputSpec, OutputSpec, SlotType, Value};
    use crate::step::registry::StepRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Step writing one file named after its output slot, containing its
    /// input rendered as a string
    fn file_step(
        name: &str,
        input: &str,
        input_ty: SlotType,
        output: &'static str,
        calls: Arc<AtomicUsize>,
        fail_when: Option<&'static str>,
    ) -> StepDescriptor {
        let input_slot = input.to_string();
        StepDescriptor::new(
            name,
            FnAction::new(move |inputs: &Inputs, ctx: &ActionContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                let value = inputs.get(&input_slot).cloned().unwrap_or_default();
                let text = match &value {
                    Value::Path(p) => std::fs::read_to_string(p)
                        .map_err(|e| Failure::new(e.to_string()))?,
                    other => other.as_string(),
                };
                if fail_when.is_some_and(|marker| text.contains(marker)) {
                    return Err(Failure::new(format!("cannot process {}", text)).with_exit_code(Some(1)));
                }
                let path = ctx.work_dir.join(output);
                std::fs::write(&path, format!("{}>{}", text, output))
                    .map_err(|e| Failure::new(e.to_string()))?;
                let mut outputs = Outputs::new();
                outputs.insert(output.to_string(), Value::path(path));
                Ok(outputs)
            }),
        )
        .input(input, InputSpec::required(input_ty))
        .output(output, OutputSpec::new(SlotType::Path))
    }

    struct Pipeline {
        graph: WorkflowGraph,
        calls: Arc<AtomicUsize>,
    }

    /// spec(subject) -> onsets, design(onsets) -> matrix, estimate(matrix) -> betas
    fn glm_pipeline(fail_design_for: Option<&'static str>) -> Pipeline {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = StepRegistry::new();
        let spec = registry
            .register(file_step("spec", "subject", SlotType::String, "onsets", calls.clone(), None))
            .unwrap();
        let design = registry
            .register(file_step(
                "design",
                "onsets",
                SlotType::Path,
                "matrix",
                calls.clone(),
                fail_design_for,
            ))
            .unwrap();
        let estimate = registry
            .register(file_step("estimate", "matrix", SlotType::Path, "betas", calls.clone(), None))
            .unwrap();

        let mut graph = WorkflowGraph::new("glm");
        graph.add_node("spec", spec).unwrap();
        graph.add_node("design", design).unwrap();
        graph.add_node("estimate", estimate).unwrap();
        graph.connect("spec", "onsets", "design", "onsets").unwrap();
        graph.connect("design", "matrix", "estimate", "matrix").unwrap();
        graph
            .mark_iterable("spec", "subject", vec!["A".into(), "B".into()])
            .unwrap();

        Pipeline { graph, calls }
    }

    fn executor(graph: &WorkflowGraph, cache: &Arc<ContentCache>, workers: usize) -> WorkflowExecutor {
        WorkflowExecutor::from_graph(graph, Arc::clone(cache))
            .unwrap()
            .with_config(ExecutorConfig::default().with_max_workers(workers))
    }

    #[tokio::test]
    async fn test_cold_then_warm_run() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let pipeline = glm_pipeline(None);

        let cold = executor(&pipeline.graph, &cache, 1).execute().await.unwrap();
        assert_eq!(cold.instances.len(), 2);
        assert_eq!(cold.executed_count(), 6);
        assert_eq!(cold.outcome(), RunOutcome::Success);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 6);

        let betas_a = cold.instance("subject=A").unwrap().record("estimate").unwrap();
        let path = betas_a.outputs.as_ref().unwrap()["betas"].as_path().unwrap().to_path_buf();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "A>onsets>matrix>betas"
        );

        // a fresh cache handle reads everything back from disk
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let warm = executor(&pipeline.graph, &cache, 1).execute().await.unwrap();
        assert_eq!(warm.executed_count(), 0);
        assert_eq!(warm.cached_count(), 6);
        assert_eq!(warm.outcome(), RunOutcome::Success);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 6);

        let warm_betas = warm.instance("subject=A").unwrap().record("estimate").unwrap();
        assert_eq!(warm_betas.outputs, betas_a.outputs);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_instance() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let pipeline = glm_pipeline(Some("B>onsets"));

        let report = executor(&pipeline.graph, &cache, 1).execute().await.unwrap();

        match report.outcome() {
            RunOutcome::PartialFailure { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].node_id, "design");
                assert_eq!(failed[0].instance, "subject=B");
                assert_eq!(failed[0].failure.exit_code, Some(1));
            }
            RunOutcome::Success => panic!("expected a partial failure"),
        }

        let a = report.instance("subject=A").unwrap();
        assert!(a.success());

        let b = report.instance("subject=B").unwrap();
        let estimate = b.record("estimate").unwrap();
        assert_eq!(estimate.status, NodeStatus::Skipped);
        assert_eq!(
            estimate.skip_reason,
            Some(SkipReason::UpstreamFailed {
                node: "design".to_string()
            })
        );
        assert_eq!(b.record("spec").unwrap().status, NodeStatus::Done);
        assert_eq!(report.executed_count(), 5);
    }

    #[tokio::test]
    async fn test_dispatch_order_is_deterministic() {
        let mut orders = Vec::new();
        for _ in 0..2 {
            let dir = tempfile::tempdir().unwrap();
            let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
            let pipeline = glm_pipeline(None);
            let report = executor(&pipeline.graph, &cache, 1).execute().await.unwrap();
            orders.push(report.dispatch_order);
        }

        assert_eq!(orders[0], orders[1]);
        assert_eq!(
            orders[0],
            vec![
                (0, "spec".to_string()),
                (0, "design".to_string()),
                (0, "estimate".to_string()),
                (1, "spec".to_string()),
                (1, "design".to_string()),
                (1, "estimate".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_parallel_workers_complete_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let pipeline = glm_pipeline(None);

        let report = executor(&pipeline.graph, &cache, 4).execute().await.unwrap();
        assert!(report.success());
        assert_eq!(report.count(NodeStatus::Done), 6);
    }

    #[tokio::test]
    async fn test_identical_nodes_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));
        let step = Arc::new(file_step("spec", "subject", SlotType::String, "onsets", calls.clone(), None));

        let mut graph = WorkflowGraph::new("dup");
        graph.add_node("first", step.clone()).unwrap();
        graph.add_node("second", step).unwrap();
        graph.set_input("first", "subject", "A").unwrap();
        graph.set_input("second", "subject", "A").unwrap();

        let report = executor(&graph, &cache, 2).execute().await.unwrap();
        assert!(report.success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.executed_count(), 1);
        assert_eq!(report.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_declared_output_fails_node() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let step = Arc::new(
            StepDescriptor::new("lazy", FnAction::new(|_, _| Ok(Outputs::new())))
                .output("result", OutputSpec::new(SlotType::Number)),
        );
        let mut graph = WorkflowGraph::new("lazy");
        graph.add_node("lazy", step).unwrap();

        let report = executor(&graph, &cache, 1).execute().await.unwrap();
        let failed = report.failed();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].failure.message.contains("result"));
    }

    #[tokio::test]
    async fn test_undeclared_outputs_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let step = Arc::new(
            StepDescriptor::new(
                "chatty",
                FnAction::new(|_, _| {
                    let mut out = Outputs::new();
                    out.insert("result".to_string(), Value::from(1i64));
                    out.insert("extra".to_string(), Value::from("noise"));
                    Ok(out)
                }),
            )
            .output("result", OutputSpec::new(SlotType::Number)),
        );
        let mut graph = WorkflowGraph::new("chatty");
        graph.add_node("chatty", step).unwrap();

        let report = executor(&graph, &cache, 1).execute().await.unwrap();
        let outputs = report.instances[0].records[0].outputs.clone().unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs.contains_key("result"));
    }

    #[tokio::test]
    async fn test_cache_corruption_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let pipeline = glm_pipeline(None);
        executor(&pipeline.graph, &cache, 1).execute().await.unwrap();

        for entry in std::fs::read_dir(dir.path().join("index")).unwrap() {
            std::fs::write(entry.unwrap().path(), "garbage").unwrap();
        }

        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let err = executor(&pipeline.graph, &cache, 1).execute().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Cache(CacheError::Corruption { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let pipeline = glm_pipeline(None);

        let executor = executor(&pipeline.graph, &cache, 1);
        executor.cancel_handle().cancel();
        let report = executor.execute().await.unwrap();

        assert!(report.cancelled);
        assert!(!report.success());
        assert_eq!(report.executed_count(), 0);
        assert_eq!(report.count(NodeStatus::Skipped), 6);
        assert!(report
            .records()
            .all(|r| r.skip_reason == Some(SkipReason::Cancelled)));
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let pipeline = glm_pipeline(Some("A>onsets"));

        let report = WorkflowExecutor::from_graph(&pipeline.graph, Arc::clone(&cache))
            .unwrap()
            .with_config(
                ExecutorConfig::default()
                    .with_max_workers(1)
                    .with_fail_fast(true),
            )
            .execute()
            .await
            .unwrap();

        assert!(report.cancelled);
        let b = report.instance("subject=B").unwrap();
        assert!(b
            .records
            .iter()
            .all(|r| r.status == NodeStatus::Skipped));
    }

    #[tokio::test]
    async fn test_progress_events_are_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let pipeline = glm_pipeline(None);
        let (tx, mut rx) = crate::execution::events::progress_channel();

        executor(&pipeline.graph, &cache, 1)
            .with_progress(tx)
            .execute()
            .await
            .unwrap();

        let mut started = 0;
        let mut completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ExecutionEvent::NodeStarted { .. } => started += 1,
                ExecutionEvent::RunCompleted { success, .. } => completed = success,
                _ => {}
            }
        }
        assert_eq!(started, 6);
        assert!(completed);
    }

    /// Copy input `n` to output `n`
    fn echo_n(inputs: &Inputs) -> Outputs {
        let mut out = Outputs::new();
        let n = inputs.get("n").cloned().unwrap_or_else(|| Value::from(0i64));
        out.insert("n".to_string(), n);
        out
    }

    fn pass_n() -> FnAction {
        FnAction::new(|inputs: &Inputs, _: &ActionContext| Ok(echo_n(inputs)))
    }

    fn number_step(name: &str, action: impl StepAction + 'static) -> Arc<StepDescriptor> {
        Arc::new(
            StepDescriptor::new(name, action)
                .input("n", InputSpec::with_default(SlotType::Number, 0i64))
                .output("n", OutputSpec::new(SlotType::Number)),
        )
    }

    /// Sleeps, recording the highest number of concurrent runs
    struct TrackedAction {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl StepAction for TrackedAction {
        async fn run(&self, inputs: &Inputs, _ctx: &ActionContext) -> Result<Outputs, Failure> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(echo_n(inputs))
        }
    }

    /// Blocks until the gate is notified
    struct GatedAction {
        gate: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl StepAction for GatedAction {
        async fn run(&self, inputs: &Inputs, _ctx: &ActionContext) -> Result<Outputs, Failure> {
            self.gate.notified().await;
            Ok(echo_n(inputs))
        }
    }

    #[tokio::test]
    async fn test_running_actions_never_exceed_workers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let step = number_step(
            "tracked",
            TrackedAction {
                running: running.clone(),
                peak: peak.clone(),
                delay: Duration::from_millis(30),
            },
        );

        let mut graph = WorkflowGraph::new("wide");
        graph.add_node("tracked", step).unwrap();
        graph
            .mark_iterable("tracked", "n", (0..6i64).map(Value::from).collect())
            .unwrap();

        let report = executor(&graph, &cache, 2).execute().await.unwrap();
        assert!(report.success());
        assert_eq!(report.executed_count(), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fast_branch_finishes_while_slow_node_runs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let gate = Arc::new(Notify::new());

        let release = {
            let gate = gate.clone();
            FnAction::new(move |inputs: &Inputs, _: &ActionContext| {
                gate.notify_one();
                Ok(echo_n(inputs))
            })
        };

        // slow only finishes once the fast branch has run to its end
        let mut graph = WorkflowGraph::new("branches");
        graph.add_node("slow", number_step("slow", GatedAction { gate })).unwrap();
        graph.add_node("fast", number_step("fast", pass_n())).unwrap();
        graph.add_node("release", number_step("release", release)).unwrap();
        graph.set_input("fast", "n", 1i64).unwrap();
        graph.connect("fast", "n", "release", "n").unwrap();

        let (tx, mut rx) = crate::execution::events::progress_channel();
        let run = executor(&graph, &cache, 2).with_progress(tx);
        let report = tokio::time::timeout(Duration::from_secs(5), run.execute())
            .await
            .expect("slow node blocked the independent branch")
            .unwrap();
        assert!(report.success());

        let mut completed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::NodeCompleted { node_id, .. } = event {
                completed.push(node_id);
            }
        }
        assert_eq!(completed.len(), 3);
        assert_eq!(completed[0], "fast");
        assert!(completed.iter().any(|n| n == "release"));
    }

    #[tokio::test]
    async fn test_cancel_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::with_cache_dir(dir.path()));
        let gate = Arc::new(Notify::new());

        let mut graph = WorkflowGraph::new("stuck");
        graph.add_node("stuck", number_step("stuck", GatedAction { gate })).unwrap();
        graph.add_node("after", number_step("after", pass_n())).unwrap();
        graph.add_node("other", number_step("other", pass_n())).unwrap();
        graph.set_input("other", "n", 2i64).unwrap();
        graph.connect("stuck", "n", "after", "n").unwrap();

        let (tx, mut rx) = crate::execution::events::progress_channel();
        let run = executor(&graph, &cache, 1).with_progress(tx);
        let handle = run.cancel_handle();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, ExecutionEvent::NodeStarted { .. }) {
                    handle.cancel();
                    break;
                }
            }
        });

        let report = tokio::time::timeout(Duration::from_secs(5), run.execute())
            .await
            .expect("cancellation did not stop the run")
            .unwrap();

        assert!(report.cancelled);
        assert!(!report.success());
        let instance = &report.instances[0];

        let stuck = instance.record("stuck").unwrap();
        assert_eq!(stuck.status, NodeStatus::Failed);
        assert!(stuck.failure.as_ref().unwrap().message.contains("cancelled"));

        for node in ["after", "other"] {
            let record = instance.record(node).unwrap();
            assert_eq!(record.status, NodeStatus::Skipped, "{}", node);
            assert_eq!(record.skip_reason, Some(SkipReason::Cancelled), "{}", node);
        }
    }
}
