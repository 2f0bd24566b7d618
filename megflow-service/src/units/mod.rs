// Units of Work
// Routines invoked by graph nodes, and the context they run in

pub mod anatomy;
pub mod command;
pub mod events;
pub mod function;
pub mod grabber;
pub mod slots;
pub mod source;

pub use anatomy::{CopyBemSurfaces, ReconAll, WatershedBem};
pub use command::{ArgBindings, CommandOutput, CommandRunner, CommandSpec, OutputCallback};
pub use events::{ConcatenateEvents, EventParams};
pub use function::FnRoutine;
pub use grabber::DataGrabber;
pub use slots::{ArtifactRef, NodeInstanceId, SlotKind, SlotSpec, SlotValue, Value};
pub use source::{InverseSolution, MorphSourceEstimate};

use crate::artifacts::ArtifactError;
use crate::execution::{EventSender, ExecutionContext, ExecutionEvent, FailureKind, ProgressSender};
use crate::resolver::ResolutionError;
use crate::stimulus::StimulusError;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Outputs of a routine, keyed by output slot name
pub type RoutineOutputs = BTreeMap<String, SlotValue>;

/// A unit of work's behaviour
///
/// Routines declare their slots once; the graph checks bindings against the
/// declaration and the executor checks the returned outputs against it.
#[async_trait::async_trait]
pub trait Routine: Send + Sync {
    /// Short name used in logs and error reports
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<SlotSpec>;

    fn outputs(&self) -> Vec<SlotSpec>;

    /// Run to completion for one node instance
    async fn invoke(&self, invocation: &InvocationContext) -> Result<RoutineOutputs, RoutineError>;
}

/// Input values bound to a node instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundInputs {
    values: BTreeMap<String, SlotValue>,
}

impl BoundInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: SlotValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&SlotValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SlotValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn require(&self, name: &str) -> Result<&SlotValue, RoutineError> {
        self.values
            .get(name)
            .ok_or_else(|| RoutineError::MissingInput(name.to_string()))
    }

    pub fn path(&self, name: &str) -> Result<&Path, RoutineError> {
        let value = self.require(name)?;
        value
            .as_path()
            .ok_or_else(|| RoutineError::input_kind(name, SlotKind::Path, value))
    }

    pub fn paths(&self, name: &str) -> Result<&[PathBuf], RoutineError> {
        let value = self.require(name)?;
        value
            .as_paths()
            .ok_or_else(|| RoutineError::input_kind(name, SlotKind::Paths, value))
    }

    pub fn scalar(&self, name: &str) -> Result<&Value, RoutineError> {
        let value = self.require(name)?;
        value
            .as_scalar()
            .ok_or_else(|| RoutineError::input_kind(name, SlotKind::Scalar, value))
    }

    /// Scalar input rendered as a string
    pub fn string(&self, name: &str) -> Result<String, RoutineError> {
        self.scalar(name).map(Value::as_string)
    }
}

impl FromIterator<(String, SlotValue)> for BoundInputs {
    fn from_iter<I: IntoIterator<Item = (String, SlotValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Everything a routine sees for one node instance
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub unit_id: String,
    pub context: ExecutionContext,
    /// Exclusive working directory `<work_root>/<context_key>/<unit_id>`
    pub work_dir: PathBuf,
    pub inputs: BoundInputs,
    pub progress: Option<ProgressSender>,
}

impl InvocationContext {
    pub fn new(
        unit_id: impl Into<String>,
        context: ExecutionContext,
        work_dir: impl Into<PathBuf>,
        inputs: BoundInputs,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            context,
            work_dir: work_dir.into(),
            inputs,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressSender>) -> Self {
        self.progress = progress;
        self
    }

    pub fn node_id(&self) -> NodeInstanceId {
        NodeInstanceId::new(&self.unit_id, self.context.key())
    }

    /// Forward child process output lines as progress events
    pub fn output_callback(&self) -> Option<OutputCallback> {
        let sender = self.progress.clone()?;
        let node = self.node_id();
        Some(Arc::new(move |line: &str, is_stderr: bool| {
            sender.send_event(ExecutionEvent::node_output(&node, line, is_stderr));
        }))
    }
}

/// Errors returned by routines
#[derive(Debug, Error)]
pub enum RoutineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("external routine '{routine}' failed ({}): {diagnostic}", describe_exit(.exit_code))]
    External {
        routine: String,
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("routine '{routine}' did not produce {}", path.display())]
    MissingOutput { routine: String, path: PathBuf },

    #[error("invalid routine output: {0}")]
    InvalidOutput(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Stimulus(#[from] StimulusError),

    #[error("missing input '{0}'")]
    MissingInput(String),

    #[error("input '{slot}' must be a {expected}, got a {found}")]
    InputKind {
        slot: String,
        expected: SlotKind,
        found: SlotKind,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("routine panicked: {0}")]
    Panicked(String),
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code".to_string(),
    }
}

impl RoutineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RoutineError::Io {
            path: path.into(),
            source,
        }
    }

    fn input_kind(slot: &str, expected: SlotKind, value: &SlotValue) -> Self {
        RoutineError::InputKind {
            slot: slot.to_string(),
            expected,
            found: value.kind(),
        }
    }

    /// Category recorded in the run report
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RoutineError::Resolution(_) => FailureKind::Resolution,
            RoutineError::External { .. }
            | RoutineError::MissingOutput { .. }
            | RoutineError::InvalidOutput(_) => FailureKind::ExternalRoutine,
            RoutineError::Artifact(ArtifactError::Exists(_)) => FailureKind::ArtifactExists,
            RoutineError::Artifact(_) | RoutineError::Io { .. } => FailureKind::Io,
            RoutineError::Stimulus(_) => FailureKind::EventTable,
            RoutineError::MissingInput(_)
            | RoutineError::InputKind { .. }
            | RoutineError::InvalidInput(_) => FailureKind::Input,
            RoutineError::Panicked(_) => FailureKind::Panicked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_inputs_accessors() {
        let inputs: BoundInputs = [
            ("subject_id".to_string(), SlotValue::scalar("sub001")),
            ("t1_file".to_string(), SlotValue::Path(PathBuf::from("/mri/t1.nii.gz"))),
        ]
        .into_iter()
        .collect();

        assert_eq!(inputs.string("subject_id").unwrap(), "sub001");
        assert_eq!(inputs.path("t1_file").unwrap(), Path::new("/mri/t1.nii.gz"));
        assert!(matches!(
            inputs.paths("t1_file"),
            Err(RoutineError::InputKind {
                expected: SlotKind::Paths,
                found: SlotKind::Path,
                ..
            })
        ));
        assert!(matches!(
            inputs.path("subjects_dir"),
            Err(RoutineError::MissingInput(_))
        ));
    }

    #[test]
    fn test_external_error_message() {
        let err = RoutineError::External {
            routine: "recon_all".into(),
            exit_code: Some(1),
            diagnostic: "ERROR: cannot find T1".into(),
        };
        assert_eq!(
            err.to_string(),
            "external routine 'recon_all' failed (exit code 1): ERROR: cannot find T1"
        );
        assert_eq!(err.failure_kind(), FailureKind::ExternalRoutine);
    }

    #[test]
    fn test_failure_kinds() {
        let exists = RoutineError::Artifact(ArtifactError::Exists(PathBuf::from("/out")));
        assert_eq!(exists.failure_kind(), FailureKind::ArtifactExists);

        let missing = RoutineError::Resolution(ResolutionError::NoMatch {
            pattern: "/data/*.fif".into(),
        });
        assert_eq!(missing.failure_kind(), FailureKind::Resolution);
        assert_eq!(
            RoutineError::Panicked("boom".into()).failure_kind(),
            FailureKind::Panicked
        );
    }

    #[tokio::test]
    async fn test_output_callback_emits_events() {
        let (tx, mut rx) = crate::execution::progress_channel();
        let invocation = InvocationContext::new(
            "recon_all",
            ExecutionContext::single("subject_id", "sub001"),
            "/work",
            BoundInputs::new(),
        )
        .with_progress(Some(tx));

        let callback = invocation.output_callback().unwrap();
        callback("recon-all started", false);

        match rx.recv().await {
            Some(ExecutionEvent::NodeOutput { node, line, is_stderr }) => {
                assert_eq!(node.unit, "recon_all");
                assert_eq!(line, "recon-all started");
                assert!(!is_stderr);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
