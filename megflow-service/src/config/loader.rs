// Pipeline Descriptor Loader
// Reads YAML or JSON descriptors into a validated PipelineConfig

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::models::PipelineConfig;

use std::fs;
use std::path::Path;

/// Descriptor syntax, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorFormat {
    Yaml,
    Json,
}

impl DescriptorFormat {
    /// `.json` selects JSON, anything else is read as YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DescriptorFormat::Json,
            _ => DescriptorFormat::Yaml,
        }
    }
}

/// Pipeline descriptor loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Parse a descriptor from YAML text
    pub fn parse_yaml(content: &str) -> ConfigResult<PipelineConfig> {
        let config: PipelineConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::from_yaml_error(&e, content))?;
        Self::finish(config)
    }

    /// Parse a descriptor from JSON text
    pub fn parse_json(content: &str) -> ConfigResult<PipelineConfig> {
        let config: PipelineConfig = serde_json::from_str(content)
            .map_err(|e| ConfigError::from_json_error(&e, content))?;
        Self::finish(config)
    }

    pub fn parse(content: &str, format: DescriptorFormat) -> ConfigResult<PipelineConfig> {
        match format {
            DescriptorFormat::Yaml => Self::parse_yaml(content),
            DescriptorFormat::Json => Self::parse_json(content),
        }
    }

    /// Load and validate a descriptor file
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<PipelineConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::io(path, &e))?;

        let config = Self::parse(&content, DescriptorFormat::from_path(path))?;
        tracing::debug!(
            path = %path.display(),
            subjects = config.subject_ids.len(),
            jobs = config.jobs,
            "loaded pipeline descriptor"
        );
        Ok(config)
    }

    fn finish(mut config: PipelineConfig) -> ConfigResult<PipelineConfig> {
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }
}
