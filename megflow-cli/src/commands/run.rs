use crate::output;

use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use megflow_service::execution::progress_channel;
use megflow_service::{
    ArtifactWriter, ExecutionEvent, NodeStatus, RunReport, WorkflowExecutor, WorkflowKind,
};

/// Run a workflow for every configured subject
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow to run (anatomy or source)
    pub workflow: WorkflowKind,

    /// Path to the pipeline descriptor (YAML or JSON)
    pub config: PathBuf,

    /// Override the descriptor's worker budget
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<NonZeroUsize>,

    /// Replace artifacts left by a previous run
    #[arg(long)]
    pub overwrite: bool,

    /// Directory for run_report.json and run_report.html
    /// (default: <output_root>/<workflow name>)
    #[arg(long, value_name = "DIR")]
    pub report_dir: Option<PathBuf>,

    /// Show output lines of external programs
    #[arg(long)]
    pub show_output: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    output::phase("Loading", &format!("{}", args.config.display()));
    let config = super::load_config(&args.config);
    let mut plan = super::build_plan(args.workflow, &config);
    if let Some(jobs) = args.jobs {
        plan.jobs = jobs.get();
    }

    let instances = match plan.instantiate() {
        Ok(instances) => instances,
        Err(e) => super::structural_failure(&e.to_string()),
    };
    plan.prepare().await?;
    tracing::debug!(
        workflow = %plan.name(),
        instances = instances.len(),
        jobs = plan.jobs,
        "workflow expanded"
    );

    output::section(&format!("Workflow: {}", plan.name()));
    output::note(&format!(
        "{} subject(s), {} unit(s), {} worker(s)",
        instances.len(),
        plan.graph.len(),
        plan.jobs
    ));
    output::detail(&format!("  work root: {}", plan.work_root.display()));
    output::detail(&format!("  artifacts: {}", plan.publish_root.display()));
    eprintln!();

    let report_dir = args
        .report_dir
        .clone()
        .unwrap_or_else(|| plan.publish_root.join(plan.name()));

    let shutdown = CancellationToken::new();
    let (tx, mut rx) = progress_channel();
    let executor = WorkflowExecutor::new(plan.executor_config())
        .with_progress(tx)
        .with_shutdown(shutdown.clone())
        .with_publisher(plan.publisher().with_overwrite(args.overwrite));

    let exec_handle = tokio::spawn(async move { executor.run(instances).await });

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupt received, letting running nodes finish");
            interrupt.cancel();
        }
    });

    while let Some(event) = rx.recv().await {
        print_event(&event, args.show_output);
    }

    let report = exec_handle.await?;
    print_summary(&report);

    let writer = ArtifactWriter::new(report_dir).with_overwrite(true);
    match writer.write_run_report(&report).await {
        Ok(paths) => {
            for path in paths {
                output::detail(&format!("  report: {}", path.display()));
            }
        }
        Err(e) => output::warning(&format!("Could not write run report: {}", e)),
    }

    std::process::exit(report.exit_code());
}

fn print_event(event: &ExecutionEvent, show_output: bool) {
    match event {
        ExecutionEvent::RunStarted { instances, nodes, .. } => {
            output::phase("Running", &format!("{} node(s) across {} instance(s)", nodes, instances));
        }

        ExecutionEvent::RunCompleted { success, duration, .. } => {
            output::run_finished(*duration, *success);
        }

        ExecutionEvent::InstanceCompleted { context_key, success } => {
            output::instance_finished(context_key, *success);
        }

        ExecutionEvent::NodeStarted { node } => {
            output::node_started(&node.context_key, &node.unit);
        }

        ExecutionEvent::NodeOutput { line, is_stderr, .. } => {
            if show_output {
                output::program_line(line, *is_stderr);
            }
        }

        ExecutionEvent::NodeCompleted { node, duration } => {
            output::node_finished(
                &node.context_key,
                &node.unit,
                NodeStatus::Completed,
                Some(*duration),
                None,
            );
        }

        ExecutionEvent::NodeFailed {
            node,
            kind,
            message,
            duration,
        } => {
            output::node_finished(
                &node.context_key,
                &node.unit,
                NodeStatus::Failed,
                Some(*duration),
                Some(&format!("{}: {}", kind, message)),
            );
        }

        ExecutionEvent::NodeSkipped { node, reason } => {
            output::node_finished(
                &node.context_key,
                &node.unit,
                NodeStatus::Skipped,
                None,
                Some(reason.as_str()),
            );
        }

        ExecutionEvent::NodeCancelled { node } => {
            output::node_finished(
                &node.context_key,
                &node.unit,
                NodeStatus::Cancelled,
                None,
                None,
            );
        }

        ExecutionEvent::ArtifactPublished { path, .. } => {
            output::artifact_published(path);
        }

        ExecutionEvent::ShutdownRequested { in_flight } => {
            output::warning(&format!("Shutting down, waiting for {} running node(s)", in_flight));
        }
    }
}

fn print_summary(report: &RunReport) {
    eprintln!();
    output::section(&format!("Summary: {}", report.workflow));
    output::status_counts(report);

    for (instance, node) in report.failures() {
        if let Some(failure) = &node.failure {
            output::rejected(&format!(
                "{} / {} ({}): {}",
                instance.context_key, node.unit, failure.kind, failure.message
            ));
        }
    }

    if report.cancelled {
        output::warning("Run was interrupted before every node was dispatched");
    }
}
