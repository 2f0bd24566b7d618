// Configuration module for pipeline descriptors
// Provides YAML/JSON loading, validation, and descriptive errors

pub mod error;
pub mod loader;
pub mod models;

pub use error::{ConfigError, ConfigErrorKind, ConfigResult};
pub use loader::{ConfigLoader, DescriptorFormat};
pub use models::*;
