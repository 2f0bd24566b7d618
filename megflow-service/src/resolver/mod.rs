// File Resolver
// Templated, glob-aware file discovery per execution context

pub mod files;
pub mod template;

pub use files::FileResolver;
pub use template::{substitute, PathTemplate, PlaceholderError, CONTEXT_KEY_PLACEHOLDER};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning a template into concrete paths
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("root directory does not exist: {}", .0.display())]
    RootMissing(PathBuf),

    #[error("placeholder '{placeholder}' in '{template}' is not bound in context {context}")]
    MissingPlaceholder {
        placeholder: String,
        template: String,
        context: String,
    },

    #[error("invalid template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    #[error("no files match '{pattern}'")]
    NoMatch { pattern: String },

    #[error("expected a single file for '{pattern}', found {count}")]
    Ambiguous { pattern: String, count: usize },

    #[error("failed to traverse {}: {message}", path.display())]
    Traversal { path: PathBuf, message: String },
}
