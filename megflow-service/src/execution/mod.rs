// Execution Engine Module
// Handles graph construction, iteration expansion, and dataflow scheduling

pub mod context;
pub mod events;
pub mod executor;
pub mod expander;
pub mod graph;
pub mod report;

// Re-export key types
pub use context::{ExecutionContext, IterationAxis};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::{ExecutorConfig, RetentionPolicy, WorkflowExecutor};
pub use expander::{GraphInstance, IterationBuilder, IterationExpander, NodeInstance};
pub use graph::{DependencyGraph, Edge, GraphError, GraphErrorKind, InputBinding, InputSlot, UnitOfWork};
pub use report::{FailureKind, InstanceReport, NodeFailure, NodeReport, NodeStatus, RunReport};
