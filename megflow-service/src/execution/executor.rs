// Workflow Executor
// Dataflow scheduling of graph instances under a bounded worker budget

use crate::artifacts::{Artifact, ArtifactError, ArtifactWriter};
use crate::execution::context::ExecutionContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::expander::GraphInstance;
use crate::execution::graph::InputBinding;
use crate::execution::report::{
    FailureKind, InstanceReport, NodeFailure, NodeReport, NodeStatus, RunReport,
};
use crate::units::{
    ArtifactRef, InvocationContext, NodeInstanceId, Routine, RoutineError, RoutineOutputs,
    SlotSpec,
};

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What happens to node working directories after their consumers finish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep every working directory
    #[default]
    KeepAll,
    /// Delete a node's working directory once all its consumers completed
    RemoveIntermediate,
}

/// Configuration for workflow execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum node instances running at once (0 is treated as 1)
    pub max_parallel: usize,
    /// Root of the per-node working directories
    pub work_root: PathBuf,
    pub retention: RetentionPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            work_root: std::env::temp_dir().join("megflow"),
            retention: RetentionPolicy::KeepAll,
        }
    }
}

/// Per-node bookkeeping kept beside the instance's node list
#[derive(Debug, Default)]
struct NodeState {
    duration: Duration,
    failure: Option<NodeFailure>,
    reason: Option<String>,
    outputs: BTreeMap<String, ArtifactRef>,
}

struct InstanceState {
    instance: GraphInstance,
    upstream: Vec<Vec<usize>>,
    downstream: Vec<Vec<usize>>,
    /// Upstream units not yet completed, per node
    pending: Vec<usize>,
    nodes: Vec<NodeState>,
    reported: bool,
}

impl InstanceState {
    fn new(instance: GraphInstance) -> Self {
        let upstream = instance.graph.upstream_indices();
        let downstream = instance.graph.downstream_indices();
        let pending = upstream.iter().map(Vec::len).collect();
        let nodes = instance.nodes.iter().map(|_| NodeState::default()).collect();
        Self {
            instance,
            upstream,
            downstream,
            pending,
            nodes,
            reported: false,
        }
    }

    fn status(&self, node: usize) -> NodeStatus {
        self.instance.nodes[node].status
    }

    fn set_status(&mut self, node: usize, status: NodeStatus) {
        self.instance.nodes[node].status = status;
    }

    fn node_id(&self, node: usize) -> &NodeInstanceId {
        &self.instance.nodes[node].id
    }

    fn is_finished(&self) -> bool {
        self.instance.nodes.iter().all(|n| n.status.is_terminal())
    }

    fn succeeded(&self) -> bool {
        self.instance
            .nodes
            .iter()
            .all(|n| n.status == NodeStatus::Completed)
    }

    fn into_report(self) -> InstanceReport {
        let context_key = self.instance.context.key();
        let nodes = self
            .instance
            .nodes
            .iter()
            .zip(self.nodes)
            .map(|(node, state)| NodeReport {
                unit: node.id.unit.clone(),
                status: node.status,
                duration_secs: state.duration.as_secs_f64(),
                failure: state.failure,
                reason: state.reason,
                outputs: state
                    .outputs
                    .into_iter()
                    .map(|(slot, artifact)| (slot, artifact.value().clone()))
                    .collect(),
            })
            .collect();

        InstanceReport {
            context: self.instance.context,
            context_key,
            nodes,
        }
    }
}

/// Finished node instance, as returned from a worker
struct Completion {
    instance: usize,
    node: usize,
    result: Result<RoutineOutputs, RoutineError>,
    duration: Duration,
}

/// Runs graph instances to completion
pub struct WorkflowExecutor {
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
    shutdown: CancellationToken,
    publisher: Option<ArtifactWriter>,
}

impl WorkflowExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            event_tx: None,
            shutdown: CancellationToken::new(),
            publisher: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Use an externally owned shutdown token
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Copy outputs of published units into an artifact tree
    pub fn with_publisher(mut self, writer: ArtifactWriter) -> Self {
        self.publisher = Some(writer);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Token that stops dispatch when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Working directory of a node instance
    pub fn work_dir(&self, context: &ExecutionContext, unit: &str) -> PathBuf {
        self.config.work_root.join(context.key()).join(unit)
    }

    fn emit(&self, event: ExecutionEvent) {
        event.trace();
        self.event_tx.send_event(event);
    }

    /// Execute every node of every instance, respecting data dependencies
    ///
    /// Failures never abort the run: a failed node's transitive consumers in
    /// the same instance are skipped and every other instance carries on.
    pub async fn run(&self, instances: Vec<GraphInstance>) -> RunReport {
        let start = Instant::now();
        let workflow = instances
            .first()
            .map(|instance| instance.graph.name().to_string())
            .unwrap_or_default();
        let total_nodes = instances.iter().map(|i| i.nodes.len()).sum();
        self.emit(ExecutionEvent::run_started(
            &workflow,
            instances.len(),
            total_nodes,
        ));

        let mut states: Vec<InstanceState> = instances.into_iter().map(InstanceState::new).collect();
        let mut ready: VecDeque<(usize, usize)> = VecDeque::new();
        for (i, state) in states.iter_mut().enumerate() {
            for n in 0..state.pending.len() {
                if state.pending[n] == 0 {
                    state.set_status(n, NodeStatus::Ready);
                    ready.push_back((i, n));
                }
            }
        }

        let max_parallel = self.config.max_parallel.max(1);
        let mut running: JoinSet<Completion> = JoinSet::new();
        let mut shutdown_seen = false;

        loop {
            if !shutdown_seen && self.shutdown.is_cancelled() {
                shutdown_seen = true;
                self.emit(ExecutionEvent::ShutdownRequested {
                    in_flight: running.len(),
                });
            }

            while !shutdown_seen && running.len() < max_parallel {
                let Some((i, n)) = ready.pop_front() else {
                    break;
                };
                self.dispatch(&mut states[i], i, n, &mut running);
            }

            if running.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = self.shutdown.cancelled(), if !shutdown_seen => continue,
                joined = running.join_next() => joined,
            };

            match joined {
                Some(Ok(completion)) => self.complete(&mut states, completion, &mut ready).await,
                Some(Err(e)) => tracing::error!(error = %e, "worker task aborted"),
                None => break,
            }
        }

        self.finish_unscheduled(&mut states);

        let success = states.iter().all(InstanceState::succeeded);
        let duration = start.elapsed();
        self.emit(ExecutionEvent::run_completed(&workflow, success, duration));

        RunReport {
            workflow,
            duration_secs: duration.as_secs_f64(),
            cancelled: shutdown_seen,
            instances: states.into_iter().map(InstanceState::into_report).collect(),
        }
    }

    /// Gather inputs for a ready node and hand it to a worker
    fn dispatch(
        &self,
        state: &mut InstanceState,
        instance_idx: usize,
        node_idx: usize,
        running: &mut JoinSet<Completion>,
    ) {
        let graph = Arc::clone(&state.instance.graph);
        let node = &state.instance.nodes[node_idx];
        let unit = &graph.units()[node.unit_index];

        let mut inputs = node.bound.clone();
        let mut missing = None;
        for input in unit.inputs() {
            let Some(InputBinding::Upstream { unit: src, slot }) = &input.binding else {
                continue;
            };
            let artifact = graph
                .unit_index(src)
                .and_then(|src_idx| state.nodes[src_idx].outputs.get(slot));
            match artifact {
                Some(artifact) => inputs.insert(input.spec.name.clone(), artifact.value().clone()),
                None if input.spec.required => {
                    missing = Some(RoutineError::MissingInput(format!(
                        "{} (from {}.{})",
                        input.spec.name, src, slot
                    )));
                }
                None => {}
            }
        }

        let invocation = InvocationContext::new(
            unit.id(),
            state.instance.context.clone(),
            self.work_dir(&state.instance.context, unit.id()),
            inputs,
        )
        .with_progress(self.event_tx.clone());

        let job = NodeJob {
            routine: Arc::clone(unit.routine()),
            outputs: unit.outputs().to_vec(),
            publisher: if unit.is_published() {
                self.publisher.clone()
            } else {
                None
            },
            invocation,
            missing,
        };

        self.emit(ExecutionEvent::node_started(&node.id));
        state.set_status(node_idx, NodeStatus::Running);

        running.spawn(async move {
            let started = Instant::now();
            // Inner task isolates panics in routine code from the scheduler
            let result = match tokio::spawn(job.execute()).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(RoutineError::Panicked(panic_message(e.into_panic()))),
                Err(e) => Err(RoutineError::Panicked(e.to_string())),
            };
            Completion {
                instance: instance_idx,
                node: node_idx,
                result,
                duration: started.elapsed(),
            }
        });
    }

    /// Record a finished node and release or skip its consumers
    async fn complete(
        &self,
        states: &mut [InstanceState],
        completion: Completion,
        ready: &mut VecDeque<(usize, usize)>,
    ) {
        let Completion {
            instance: i,
            node: n,
            result,
            duration,
        } = completion;
        let state = &mut states[i];
        state.nodes[n].duration = duration;
        let node_id = state.node_id(n).clone();

        match result {
            Ok(outputs) => {
                state.set_status(n, NodeStatus::Completed);
                state.nodes[n].outputs = outputs
                    .into_iter()
                    .map(|(slot, value)| {
                        let artifact = ArtifactRef::new(node_id.clone(), slot.clone(), value);
                        (slot, artifact)
                    })
                    .collect();
                self.emit(ExecutionEvent::node_completed(&node_id, duration));

                for d in state.downstream[n].clone() {
                    state.pending[d] = state.pending[d].saturating_sub(1);
                    if state.pending[d] == 0 && state.status(d) == NodeStatus::Pending {
                        state.set_status(d, NodeStatus::Ready);
                        ready.push_back((i, d));
                    }
                }

                if self.config.retention == RetentionPolicy::RemoveIntermediate {
                    self.release_upstream(state, n).await;
                }
            }
            Err(err) => {
                let failure = NodeFailure {
                    kind: err.failure_kind(),
                    message: err.to_string(),
                };
                state.set_status(n, NodeStatus::Failed);
                self.emit(ExecutionEvent::node_failed(
                    &node_id,
                    failure.kind,
                    &failure.message,
                    duration,
                ));
                state.nodes[n].failure = Some(failure);
                self.skip_downstream(state, n);
            }
        }

        if !state.reported && state.is_finished() {
            state.reported = true;
            self.emit(ExecutionEvent::instance_completed(
                state.instance.context.key(),
                state.succeeded(),
            ));
        }
    }

    /// Mark every transitive consumer of a failed node as skipped
    fn skip_downstream(&self, state: &mut InstanceState, failed: usize) {
        let reason = format!("upstream '{}' failed", state.node_id(failed).unit);
        let mut queue: VecDeque<usize> = state.downstream[failed].iter().copied().collect();

        while let Some(d) = queue.pop_front() {
            if !matches!(state.status(d), NodeStatus::Pending | NodeStatus::Ready) {
                continue;
            }
            state.set_status(d, NodeStatus::Skipped);
            state.nodes[d].reason = Some(reason.clone());
            self.emit(ExecutionEvent::node_skipped(state.node_id(d), &reason));
            queue.extend(state.downstream[d].iter().copied());
        }
    }

    /// Delete working directories of upstream nodes whose consumers all completed
    async fn release_upstream(&self, state: &InstanceState, node: usize) {
        for &u in &state.upstream[node] {
            let consumers = &state.downstream[u];
            let all_done = consumers
                .iter()
                .all(|&d| state.status(d) == NodeStatus::Completed);
            if !all_done {
                continue;
            }

            let dir = self.work_dir(&state.instance.context, &state.node_id(u).unit);
            remove_work_dir(&dir).await;
        }
    }

    /// Nodes never dispatched end as cancelled
    fn finish_unscheduled(&self, states: &mut [InstanceState]) {
        for state in states.iter_mut() {
            for n in 0..state.instance.nodes.len() {
                match state.status(n) {
                    NodeStatus::Pending | NodeStatus::Ready => {
                        state.set_status(n, NodeStatus::Cancelled);
                        state.nodes[n].reason = Some("shutdown requested before dispatch".to_string());
                        self.emit(ExecutionEvent::node_cancelled(state.node_id(n)));
                    }
                    NodeStatus::Running => {
                        state.set_status(n, NodeStatus::Failed);
                        state.nodes[n].failure = Some(NodeFailure {
                            kind: FailureKind::Panicked,
                            message: "worker task was lost".to_string(),
                        });
                    }
                    _ => {}
                }
            }

            if !state.reported {
                state.reported = true;
                self.emit(ExecutionEvent::instance_completed(
                    state.instance.context.key(),
                    state.succeeded(),
                ));
            }
        }
    }
}

/// Everything a worker needs to run one node instance
struct NodeJob {
    routine: Arc<dyn Routine>,
    outputs: Vec<SlotSpec>,
    publisher: Option<ArtifactWriter>,
    invocation: InvocationContext,
    missing: Option<RoutineError>,
}

impl NodeJob {
    async fn execute(self) -> Result<RoutineOutputs, RoutineError> {
        if let Some(err) = self.missing {
            return Err(err);
        }

        let work_dir = &self.invocation.work_dir;
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| RoutineError::io(work_dir, e))?;

        let produced = self.routine.invoke(&self.invocation).await?;
        let outputs = check_outputs(self.routine.name(), &self.outputs, produced)?;

        if let Some(writer) = &self.publisher {
            publish(writer, &self.invocation, &outputs).await?;
        }
        Ok(outputs)
    }
}

/// Keep declared outputs only, and require each required one with the right kind
fn check_outputs(
    routine: &str,
    declared: &[SlotSpec],
    mut produced: RoutineOutputs,
) -> Result<RoutineOutputs, RoutineError> {
    let mut outputs = RoutineOutputs::new();
    for spec in declared {
        match produced.remove(&spec.name) {
            Some(value) if value.kind() == spec.kind => {
                outputs.insert(spec.name.clone(), value);
            }
            Some(value) => {
                return Err(RoutineError::InvalidOutput(format!(
                    "routine '{}' returned a {} for output '{}', expected a {}",
                    routine,
                    value.kind(),
                    spec.name,
                    spec.kind
                )));
            }
            None if spec.required => {
                return Err(RoutineError::InvalidOutput(format!(
                    "routine '{}' did not return output '{}'",
                    routine, spec.name
                )));
            }
            None => {}
        }
    }

    for extra in produced.keys() {
        tracing::debug!(routine, output = %extra, "dropping undeclared output");
    }
    Ok(outputs)
}

/// Copy every output file into `<root>/<context_key>/<unit>/`
/// Copy a node's file outputs under the publish root
///
/// Destinations are checked before anything is copied, so a refused publish
/// leaves no partial set of artifacts behind.
async fn publish(
    writer: &ArtifactWriter,
    invocation: &InvocationContext,
    outputs: &RoutineOutputs,
) -> Result<(), RoutineError> {
    let node = invocation.node_id();

    let mut pending: HashMap<PathBuf, &Path> = HashMap::new();
    let mut artifacts = Vec::new();
    for value in outputs.values() {
        for path in value.paths() {
            if !path.is_file() {
                tracing::debug!(path = %path.display(), "not a file, not published");
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            let artifact = Artifact::file(name.to_string_lossy(), path);
            let destination =
                writer.path_for(&invocation.context, &invocation.unit_id, &artifact.name)?;
            match pending.get(&destination) {
                Some(source) if *source == path => continue,
                Some(_) => return Err(ArtifactError::Exists(destination).into()),
                None => {}
            }
            if !writer.overwrite() && destination.exists() {
                return Err(ArtifactError::Exists(destination).into());
            }
            pending.insert(destination, path);
            artifacts.push(artifact);
        }
    }

    for artifact in &artifacts {
        let written = writer
            .write(&invocation.context, &invocation.unit_id, artifact)
            .await?;
        invocation.progress.send_event(ExecutionEvent::ArtifactPublished {
            node: node.clone(),
            path: written,
        });
    }
    Ok(())
}

async fn remove_work_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(dir = %dir.display(), "removed intermediate outputs"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "failed to remove intermediate outputs"),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{DependencyGraph, IterationAxis, IterationExpander, UnitOfWork};
    use crate::units::{FnRoutine, SlotValue};

    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Writes `<unit>.txt` into its working directory, appending its input's content
    fn stage(name: &'static str, with_input: bool) -> FnRoutine {
        let routine = FnRoutine::new(name, move |inv| {
            let mut content = String::new();
            if with_input {
                let upstream = inv.inputs.path("in")?;
                content = std::fs::read_to_string(upstream).map_err(|e| RoutineError::io(upstream, e))?;
            }
            content.push_str(name);
            let out = inv.work_dir.join(format!("{name}.txt"));
            std::fs::write(&out, content).map_err(|e| RoutineError::io(&out, e))?;
            Ok(RoutineOutputs::from([("out".to_string(), SlotValue::Path(out))]))
        })
        .output(SlotSpec::path("out"));
        if with_input {
            routine.input(SlotSpec::path("in"))
        } else {
            routine
        }
    }

    fn failing(name: &'static str, fail_for: &'static str) -> FnRoutine {
        FnRoutine::new(name, move |inv| {
            if inv.context.get("subject_id") == Some(fail_for) {
                return Err(RoutineError::External {
                    routine: name.to_string(),
                    exit_code: Some(1),
                    diagnostic: "recon-all exited with ERRORS".to_string(),
                });
            }
            let out = inv.work_dir.join("done");
            std::fs::write(&out, "ok").map_err(|e| RoutineError::io(&out, e))?;
            Ok(RoutineOutputs::from([("out".to_string(), SlotValue::Path(out))]))
        })
        .input(SlotSpec::path("in"))
        .output(SlotSpec::path("out"))
    }

    fn chain(units: Vec<(&str, FnRoutine)>) -> Arc<DependencyGraph> {
        let mut graph = DependencyGraph::new("chain");
        let ids: Vec<String> = units.iter().map(|(id, _)| id.to_string()).collect();
        for (id, routine) in units {
            graph.add_unit(UnitOfWork::new(id, routine)).unwrap();
        }
        for pair in ids.windows(2) {
            graph.connect(&pair[0], "out", &pair[1], "in").unwrap();
        }
        Arc::new(graph)
    }

    fn subjects(ids: &[&str]) -> Vec<IterationAxis> {
        vec![IterationAxis::new("subject_id", ids.iter().copied())]
    }

    fn executor(work_root: &Path, max_parallel: usize) -> WorkflowExecutor {
        WorkflowExecutor::new(ExecutorConfig {
            max_parallel,
            work_root: work_root.to_path_buf(),
            retention: RetentionPolicy::KeepAll,
        })
    }

    #[tokio::test]
    async fn test_outputs_flow_downstream() {
        let temp = tempfile::tempdir().unwrap();
        let graph = chain(vec![
            ("grab", stage("grab", false)),
            ("recon", stage("recon", true)),
            ("bem", stage("bem", true)),
        ]);
        let instances = IterationExpander::expand(&subjects(&["sub001"]), graph).unwrap();

        let report = executor(temp.path(), 2).run(instances).await;

        assert!(report.success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.count(NodeStatus::Completed), 3);

        let bem_out = temp.path().join("_subject_id_sub001/bem/bem.txt");
        assert_eq!(std::fs::read_to_string(&bem_out).unwrap(), "grabreconbem");

        let instance = report.instance("_subject_id_sub001").unwrap();
        assert_eq!(
            instance.node("bem").unwrap().outputs["out"],
            SlotValue::Path(bem_out)
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_instance() {
        let temp = tempfile::tempdir().unwrap();
        let graph = chain(vec![
            ("grab", stage("grab", false)),
            ("recon_all", failing("recon_all", "sub002")),
            ("watershed", stage("watershed", true)),
            ("copy_bem", stage("copy_bem", true)),
        ]);
        let instances = IterationExpander::expand(&subjects(&["sub001", "sub002"]), graph).unwrap();

        let report = executor(temp.path(), 4).run(instances).await;

        assert_eq!(report.exit_code(), 1);
        assert!(report.instance("_subject_id_sub001").unwrap().success());

        let failed = report.instance("_subject_id_sub002").unwrap();
        assert_eq!(failed.node("grab").unwrap().status, NodeStatus::Completed);
        let recon = failed.node("recon_all").unwrap();
        assert_eq!(recon.status, NodeStatus::Failed);
        let failure = recon.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::ExternalRoutine);
        assert!(failure.message.contains("recon-all exited with ERRORS"));

        for unit in ["watershed", "copy_bem"] {
            let node = failed.node(unit).unwrap();
            assert_eq!(node.status, NodeStatus::Skipped);
            assert_eq!(node.reason.as_deref(), Some("upstream 'recon_all' failed"));
        }
        assert!(!temp.path().join("_subject_id_sub002/watershed").exists());
    }

    #[tokio::test]
    async fn test_empty_run_succeeds() {
        let temp = tempfile::tempdir().unwrap();
        let graph = chain(vec![("grab", stage("grab", false))]);
        let instances = IterationExpander::expand(&subjects(&[]), graph).unwrap();
        assert!(instances.is_empty());

        let (tx, mut rx) = crate::execution::progress_channel();
        let report = executor(temp.path(), 4).with_progress(tx).run(instances).await;

        assert_eq!(report.total_nodes(), 0);
        assert_eq!(report.exit_code(), 0);
        assert!(matches!(
            rx.recv().await,
            Some(ExecutionEvent::RunStarted { nodes: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let temp = tempfile::tempdir().unwrap();
        let boom = FnRoutine::new("boom", |_| panic!("segfault in routine"))
            .output(SlotSpec::path("out"));
        let graph = chain(vec![("boom", boom), ("after", stage("after", true))]);
        let instances = IterationExpander::expand(&subjects(&["sub001", "sub002"]), graph).unwrap();

        let report = executor(temp.path(), 2).run(instances).await;

        assert_eq!(report.count(NodeStatus::Failed), 2);
        assert_eq!(report.count(NodeStatus::Skipped), 2);
        let (_, node) = report.failures().next().unwrap();
        let failure = node.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::Panicked);
        assert!(failure.message.contains("segfault in routine"));
    }

    #[tokio::test]
    async fn test_missing_declared_output_fails() {
        let temp = tempfile::tempdir().unwrap();
        let lazy = FnRoutine::new("lazy", |_| Ok(RoutineOutputs::new())).output(SlotSpec::path("out"));
        let wrong = FnRoutine::new("wrong", |_| {
            Ok(RoutineOutputs::from([("out".to_string(), SlotValue::scalar("x"))]))
        })
        .output(SlotSpec::path("out"));

        let mut graph = DependencyGraph::new("outputs");
        graph.add_unit(UnitOfWork::new("lazy", lazy)).unwrap();
        graph.add_unit(UnitOfWork::new("wrong", wrong)).unwrap();
        let instances = IterationExpander::expand(&subjects(&["sub001"]), Arc::new(graph)).unwrap();

        let report = executor(temp.path(), 1).run(instances).await;
        let instance = &report.instances[0];
        for unit in ["lazy", "wrong"] {
            let node = instance.node(unit).unwrap();
            assert_eq!(node.status, NodeStatus::Failed);
            assert_eq!(node.failure.as_ref().unwrap().kind, FailureKind::ExternalRoutine);
        }
    }

    /// Async routine that records how many invocations overlap
    struct Sleeper {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Routine for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        fn inputs(&self) -> Vec<SlotSpec> {
            Vec::new()
        }

        fn outputs(&self) -> Vec<SlotSpec> {
            Vec::new()
        }

        async fn invoke(&self, _: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(RoutineOutputs::new())
        }
    }

    #[tokio::test]
    async fn test_worker_budget_is_respected() {
        let temp = tempfile::tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut graph = DependencyGraph::new("budget");
        graph
            .add_unit(UnitOfWork::new(
                "sleep",
                Sleeper {
                    active: active.clone(),
                    peak: peak.clone(),
                },
            ))
            .unwrap();
        let ids: Vec<String> = (1..=6).map(|i| format!("sub{i:03}")).collect();
        let axes = vec![IterationAxis::new("subject_id", ids)];
        let instances = IterationExpander::expand(&axes, Arc::new(graph)).unwrap();

        let report = executor(temp.path(), 2).run(instances).await;

        assert!(report.success());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    /// Stage that logs its completions; one subject can be held on a gate
    struct Relay {
        stage: &'static str,
        with_input: bool,
        log: Arc<std::sync::Mutex<Vec<String>>>,
        hold: Option<(&'static str, Arc<Notify>)>,
        signal: Option<(&'static str, Arc<Notify>)>,
    }

    impl Relay {
        fn new(stage: &'static str, with_input: bool, log: &Arc<std::sync::Mutex<Vec<String>>>) -> Self {
            Self {
                stage,
                with_input,
                log: Arc::clone(log),
                hold: None,
                signal: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl Routine for Relay {
        fn name(&self) -> &str {
            self.stage
        }

        fn inputs(&self) -> Vec<SlotSpec> {
            if self.with_input {
                vec![SlotSpec::path("in")]
            } else {
                Vec::new()
            }
        }

        fn outputs(&self) -> Vec<SlotSpec> {
            vec![SlotSpec::path("out")]
        }

        async fn invoke(&self, inv: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
            let subject = inv.context.get("subject_id").unwrap_or_default();
            if let Some((held, gate)) = &self.hold {
                if subject == *held {
                    gate.notified().await;
                }
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.stage, subject));
            if let Some((watched, reached)) = &self.signal {
                if subject == *watched {
                    reached.notify_one();
                }
            }
            Ok(RoutineOutputs::from([(
                "out".to_string(),
                SlotValue::Path(inv.work_dir.clone()),
            )]))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_instances_advance_independently() {
        let temp = tempfile::tempdir().unwrap();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());
        let reached = Arc::new(Notify::new());

        let mut first = Relay::new("first", false, &log);
        first.hold = Some(("sub002", gate.clone()));
        let mut second = Relay::new("second", true, &log);
        second.signal = Some(("sub001", reached.clone()));

        let mut graph = DependencyGraph::new("dataflow");
        graph.add_unit(UnitOfWork::new("first", first)).unwrap();
        graph.add_unit(UnitOfWork::new("second", second)).unwrap();
        graph.connect("first", "out", "second", "in").unwrap();
        let instances =
            IterationExpander::expand(&subjects(&["sub001", "sub002"]), Arc::new(graph)).unwrap();

        let executor = executor(temp.path(), 2);
        let run = tokio::spawn(async move { executor.run(instances).await });

        // sub001 reaches its second stage while sub002's first stage is held
        tokio::time::timeout(Duration::from_secs(5), reached.notified())
            .await
            .expect("sub001 waited for sub002");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:sub001".to_string(), "second:sub001".to_string()]
        );

        gate.notify_one();
        let report = run.await.unwrap();

        assert!(report.success());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:sub001", "second:sub001", "first:sub002", "second:sub002"]
        );
    }

    /// Cancels the shared token when invoked
    struct Interrupt(CancellationToken);

    #[async_trait::async_trait]
    impl Routine for Interrupt {
        fn name(&self) -> &str {
            "interrupt"
        }

        fn inputs(&self) -> Vec<SlotSpec> {
            Vec::new()
        }

        fn outputs(&self) -> Vec<SlotSpec> {
            vec![SlotSpec::path("out")]
        }

        async fn invoke(&self, inv: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
            self.0.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(RoutineOutputs::from([(
                "out".to_string(),
                SlotValue::Path(inv.work_dir.clone()),
            )]))
        }
    }

    #[tokio::test]
    async fn test_shutdown_lets_running_nodes_finish() {
        let temp = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();

        let mut graph = DependencyGraph::new("shutdown");
        graph
            .add_unit(UnitOfWork::new("grab", Interrupt(token.clone())))
            .unwrap();
        graph.add_unit(UnitOfWork::new("recon", stage("recon", true))).unwrap();
        graph.connect("grab", "out", "recon", "in").unwrap();
        let instances =
            IterationExpander::expand(&subjects(&["sub001", "sub002"]), Arc::new(graph)).unwrap();

        let report = executor(temp.path(), 1)
            .with_shutdown(token)
            .run(instances)
            .await;

        assert!(report.cancelled);
        assert_eq!(report.exit_code(), 1);
        let first = report.instance("_subject_id_sub001").unwrap();
        assert_eq!(first.node("grab").unwrap().status, NodeStatus::Completed);
        assert_eq!(first.node("recon").unwrap().status, NodeStatus::Cancelled);

        let second = report.instance("_subject_id_sub002").unwrap();
        assert!(second
            .nodes
            .iter()
            .all(|node| node.status == NodeStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_remove_intermediate_outputs() {
        let temp = tempfile::tempdir().unwrap();
        let graph = chain(vec![
            ("grab", stage("grab", false)),
            ("recon", stage("recon", true)),
            ("bem", stage("bem", true)),
        ]);
        let instances = IterationExpander::expand(&subjects(&["sub001"]), graph).unwrap();

        let executor = WorkflowExecutor::new(ExecutorConfig {
            max_parallel: 1,
            work_root: temp.path().to_path_buf(),
            retention: RetentionPolicy::RemoveIntermediate,
        });
        let report = executor.run(instances).await;

        assert!(report.success());
        let instance_dir = temp.path().join("_subject_id_sub001");
        assert!(!instance_dir.join("grab").exists());
        assert!(!instance_dir.join("recon").exists());
        assert!(instance_dir.join("bem/bem.txt").exists());
    }

    #[tokio::test]
    async fn test_published_outputs_are_copied() {
        let temp = tempfile::tempdir().unwrap();
        let reports = temp.path().join("reports");

        let mut graph = DependencyGraph::new("publish");
        graph
            .add_unit(UnitOfWork::new("copy_bem_surf", stage("copy_bem_surf", false)).published())
            .unwrap();
        let graph = Arc::new(graph);

        let run = |graph: Arc<DependencyGraph>| {
            let executor = executor(&temp.path().join("work"), 1)
                .with_publisher(ArtifactWriter::new(&reports));
            async move {
                let instances = IterationExpander::expand(&subjects(&["sub001"]), graph).unwrap();
                executor.run(instances).await
            }
        };

        let report = run(Arc::clone(&graph)).await;
        assert!(report.success());
        let published = reports.join("_subject_id_sub001/copy_bem_surf/copy_bem_surf.txt");
        assert_eq!(std::fs::read_to_string(&published).unwrap(), "copy_bem_surf");

        // Second run refuses to overwrite the published artifact
        let report = run(graph).await;
        let node = report.instances[0].node("copy_bem_surf").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.failure.as_ref().unwrap().kind, FailureKind::ArtifactExists);
    }

    #[tokio::test]
    async fn test_refused_publish_copies_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let reports = temp.path().join("reports");

        let routine = FnRoutine::new("make_inverse", |inv| {
            let mut outputs = RoutineOutputs::new();
            for name in ["sub001-inv.fif", "sub001-fwd.fif"] {
                let out = inv.work_dir.join(name);
                std::fs::write(&out, "new").map_err(|e| RoutineError::io(&out, e))?;
                outputs.insert(name.to_string(), SlotValue::Path(out));
            }
            Ok(outputs)
        })
        .output(SlotSpec::path("sub001-inv.fif"))
        .output(SlotSpec::path("sub001-fwd.fif"));

        let mut graph = DependencyGraph::new("publish");
        graph
            .add_unit(UnitOfWork::new("make_inverse", routine).published())
            .unwrap();
        let instances = IterationExpander::expand(&subjects(&["sub001"]), Arc::new(graph)).unwrap();

        let unit_dir = reports.join("_subject_id_sub001/make_inverse");
        std::fs::create_dir_all(&unit_dir).unwrap();
        std::fs::write(unit_dir.join("sub001-inv.fif"), "old").unwrap();

        let report = executor(&temp.path().join("work"), 1)
            .with_publisher(ArtifactWriter::new(&reports))
            .run(instances)
            .await;

        let node = report.instances[0].node("make_inverse").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.failure.as_ref().unwrap().kind, FailureKind::ArtifactExists);
        assert!(!unit_dir.join("sub001-fwd.fif").exists());
        assert_eq!(std::fs::read_to_string(unit_dir.join("sub001-inv.fif")).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_events_cover_every_node() {
        let temp = tempfile::tempdir().unwrap();
        let graph = chain(vec![
            ("grab", stage("grab", false)),
            ("recon", failing("recon", "sub001")),
            ("bem", stage("bem", true)),
        ]);
        let instances = IterationExpander::expand(&subjects(&["sub001"]), graph).unwrap();

        let (tx, mut rx) = crate::execution::progress_channel();
        executor(temp.path(), 1).with_progress(tx).run(instances).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let label = match event {
                ExecutionEvent::NodeCompleted { node, .. } => format!("completed:{}", node.unit),
                ExecutionEvent::NodeFailed { node, .. } => format!("failed:{}", node.unit),
                ExecutionEvent::NodeSkipped { node, .. } => format!("skipped:{}", node.unit),
                ExecutionEvent::InstanceCompleted { success, .. } => format!("instance:{success}"),
                _ => continue,
            };
            seen.push(label);
        }
        assert_eq!(
            seen,
            vec!["completed:grab", "failed:recon", "skipped:bem", "instance:false"]
        );
    }
}
