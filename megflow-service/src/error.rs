// Service Errors
// Umbrella error for library callers

use crate::artifacts::ArtifactError;
use crate::config::ConfigError;
use crate::execution::GraphError;
use crate::resolver::ResolutionError;
use crate::units::RoutineError;

use std::path::PathBuf;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced by the service API
///
/// Configuration and graph errors are structural: they are raised before any
/// node instance is dispatched. The remaining variants only appear when a
/// caller drives a single component directly; during a run they are captured
/// per node instance in the run report instead.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Routine(#[from] RoutineError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ServiceError {
    /// Whether the error was detected before dispatch (configuration or graph definition)
    pub fn is_structural(&self) -> bool {
        matches!(self, ServiceError::Config(_) | ServiceError::Graph(_))
    }
}
