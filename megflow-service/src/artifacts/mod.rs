// Artifacts
// Deterministic on-disk layout for stage outputs and run reports

pub mod html;
pub mod writer;

pub use html::{bem_report_html, html_escape, render_run_report};
pub use writer::ArtifactWriter;

use crate::resolver::ResolutionError;

use std::path::PathBuf;
use thiserror::Error;

/// Where an artifact's content comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Bytes(Vec<u8>),
    /// Existing file, copied into place
    File(PathBuf),
}

/// A named piece of output destined for the artifact tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub source: ArtifactSource,
}

impl Artifact {
    pub fn bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            source: ArtifactSource::Bytes(bytes.into()),
        }
    }

    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::bytes(name, text.into().into_bytes())
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: ArtifactSource::File(path.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact already exists: {}", .0.display())]
    Exists(PathBuf),

    #[error("invalid artifact or stage name '{0}'")]
    InvalidName(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("failed to write artifact {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize run report: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ArtifactError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ArtifactError::Io {
            path: path.into(),
            source,
        }
    }
}
