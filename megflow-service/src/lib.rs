// megflow Service Library
// Orchestration core for multi-subject neuroimaging pipelines

pub mod artifacts;
pub mod config;
pub mod error;
pub mod execution;
pub mod resolver;
pub mod stimulus;
pub mod units;
pub mod utils;
pub mod workflows;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

// Re-export configuration types
pub use config::{ConfigError, ConfigErrorKind, ConfigLoader, PipelineConfig};

// Re-export resolver types
pub use resolver::{FileResolver, PathTemplate, ResolutionError};

// Re-export execution types
pub use execution::{
    DependencyGraph, ExecutionContext, ExecutionEvent, ExecutorConfig, GraphError, GraphErrorKind,
    GraphInstance, InputBinding, IterationAxis, IterationExpander, NodeStatus, ProgressSender,
    RetentionPolicy, RunReport, UnitOfWork, WorkflowExecutor,
};

// Re-export unit-of-work types
pub use units::{
    ArtifactRef, CommandRunner, CommandSpec, FnRoutine, InvocationContext, Routine, RoutineError,
    RoutineOutputs, SlotKind, SlotSpec, SlotValue, Value,
};

// Re-export artifact types
pub use artifacts::{Artifact, ArtifactError, ArtifactWriter};

// Re-export workflow types
pub use workflows::{WorkflowKind, WorkflowPlan};
