// Artifact Writer
// Writes artifacts to <root>/<context_key>/<stage>/<name>

use super::{html, Artifact, ArtifactError, ArtifactSource};
use crate::execution::{ExecutionContext, RunReport};
use crate::resolver::{PathTemplate, CONTEXT_KEY_PLACEHOLDER};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const RUN_REPORT_JSON: &str = "run_report.json";
pub const RUN_REPORT_HTML: &str = "run_report.html";

/// Writes artifacts into a per-context tree under one root
///
/// With `overwrite` off (the default) an existing file is never touched and
/// the write fails with [`ArtifactError::Exists`].
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
    overwrite: bool,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overwrite: false,
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    /// Template locating an artifact for any context
    ///
    /// The file resolver accepts it as-is, so written artifacts can be found
    /// again by later workflows. Names holding glob characters are rejected
    /// since the resolver would read them as patterns.
    pub fn template(&self, stage: &str, name: &str) -> Result<PathTemplate, ArtifactError> {
        check_name(stage)?;
        check_name(name)?;
        Ok(PathTemplate::new(
            &self.root,
            format!(
                "{{{}}}/{}/{}",
                CONTEXT_KEY_PLACEHOLDER,
                escape_braces(stage),
                escape_braces(name)
            ),
        ))
    }

    pub fn path_for(
        &self,
        context: &ExecutionContext,
        stage: &str,
        name: &str,
    ) -> Result<PathBuf, ArtifactError> {
        Ok(self.template(stage, name)?.render_path(context)?)
    }

    /// Write one artifact and return its final path
    pub async fn write(
        &self,
        context: &ExecutionContext,
        stage: &str,
        artifact: &Artifact,
    ) -> Result<PathBuf, ArtifactError> {
        let path = self.path_for(context, stage, &artifact.name)?;
        let content = match &artifact.source {
            ArtifactSource::Bytes(bytes) => bytes.clone(),
            ArtifactSource::File(source) => fs::read(source)
                .await
                .map_err(|e| ArtifactError::io(source, e))?,
        };
        self.write_file(&path, &content).await?;

        tracing::debug!(path = %path.display(), context = %context, stage, "artifact written");
        Ok(path)
    }

    /// Write `run_report.json` and `run_report.html` at the root
    pub async fn write_run_report(&self, report: &RunReport) -> Result<Vec<PathBuf>, ArtifactError> {
        let json = report.to_json()?;
        let page = html::render_run_report(report);

        let mut written = Vec::with_capacity(2);
        for (name, content) in [(RUN_REPORT_JSON, json), (RUN_REPORT_HTML, page)] {
            let path = self.root.join(name);
            self.write_file(&path, content.as_bytes()).await?;
            written.push(path);
        }

        tracing::info!(root = %self.root.display(), "run report written");
        Ok(written)
    }

    async fn write_file(&self, path: &Path, content: &[u8]) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ArtifactError::io(parent, e))?;
        }

        let mut options = OpenOptions::new();
        options.write(true);
        if self.overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let mut file = match options.open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ArtifactError::Exists(path.to_path_buf()))
            }
            Err(e) => return Err(ArtifactError::io(path, e)),
        };
        file.write_all(content)
            .await
            .map_err(|e| ArtifactError::io(path, e))?;
        file.flush().await.map_err(|e| ArtifactError::io(path, e))
    }
}

fn check_name(name: &str) -> Result<(), ArtifactError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains(['*', '?', '[', ']']);
    if invalid {
        return Err(ArtifactError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn escape_braces(name: &str) -> String {
    name.replace('{', "{{").replace('}', "}}")
}
