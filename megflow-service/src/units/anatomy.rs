// Anatomy Routines
// FreeSurfer reconstruction and BEM surface generation

use super::{
    ArgBindings, CommandRunner, CommandSpec, InvocationContext, Routine, RoutineError,
    RoutineOutputs, SlotSpec, SlotValue,
};
use crate::artifacts::bem_report_html;

use std::path::{Path, PathBuf};

/// Surfaces produced by the watershed algorithm, in report order
pub const BEM_SURFACES: [&str; 4] = ["brain", "inner_skull", "outer_skull", "outer_skin"];

pub const BEM_REPORT: &str = "BEM_report.html";

/// Runs `recon-all` for one subject
///
/// `SUBJECTS_DIR` and `FREESURFER_HOME` are set on the child process only.
#[derive(Debug, Clone)]
pub struct ReconAll {
    command: CommandSpec,
    freesurfer_home: PathBuf,
}

impl ReconAll {
    pub fn new(freesurfer_home: impl Into<PathBuf>) -> Self {
        Self {
            command: Self::default_command(),
            freesurfer_home: freesurfer_home.into(),
        }
    }

    pub fn default_command() -> CommandSpec {
        CommandSpec::new("recon-all").args([
            "-subjid",
            "{subject_id}",
            "-i",
            "{t1_file}",
            "-all",
            "-sd",
            "{subjects_dir}",
        ])
    }

    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.command = command;
        self
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }
}

#[async_trait::async_trait]
impl Routine for ReconAll {
    fn name(&self) -> &str {
        "recon_all"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::scalar("subject_id"),
            SlotSpec::path("t1_file"),
            SlotSpec::path("subjects_dir"),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::scalar("subject_id")]
    }

    async fn invoke(&self, invocation: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
        let subject = invocation.inputs.string("subject_id")?;
        let subjects_dir = invocation.inputs.path("subjects_dir")?;

        let runner = CommandRunner::new()
            .with_env("SUBJECTS_DIR", subjects_dir.to_string_lossy())
            .with_env("FREESURFER_HOME", self.freesurfer_home.to_string_lossy());
        runner
            .run_spec(
                self.name(),
                &self.command,
                &ArgBindings::from_invocation(invocation),
                invocation,
            )
            .await?;

        Ok(subject_output(subject))
    }
}

/// Runs the MNE watershed BEM generation for one subject
#[derive(Debug, Clone)]
pub struct WatershedBem {
    command: CommandSpec,
}

impl WatershedBem {
    pub fn new() -> Self {
        Self {
            command: Self::default_command(),
        }
    }

    pub fn default_command() -> CommandSpec {
        CommandSpec::new("mne").args([
            "watershed_bem",
            "--subject",
            "{subject_id}",
            "--subjects-dir",
            "{subjects_dir}",
            "--overwrite",
        ])
    }

    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.command = command;
        self
    }
}

impl Default for WatershedBem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Routine for WatershedBem {
    fn name(&self) -> &str {
        "watershed_bem"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::scalar("subject_id"), SlotSpec::path("subjects_dir")]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::scalar("subject_id")]
    }

    async fn invoke(&self, invocation: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
        let subject = invocation.inputs.string("subject_id")?;
        let subjects_dir = invocation.inputs.path("subjects_dir")?;

        CommandRunner::new()
            .with_env("SUBJECTS_DIR", subjects_dir.to_string_lossy())
            .run_spec(
                self.name(),
                &self.command,
                &ArgBindings::from_invocation(invocation),
                invocation,
            )
            .await?;

        Ok(subject_output(subject))
    }
}

/// Copies the watershed meshes to the names forward modelling expects
///
/// `bem/watershed/<subject>_<surface>_surface` becomes `bem/<surface>.surf`,
/// and a summary page is written to `bem/BEM_report.html`.
#[derive(Debug, Clone, Default)]
pub struct CopyBemSurfaces;

impl CopyBemSurfaces {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Routine for CopyBemSurfaces {
    fn name(&self) -> &str {
        "copy_bem_surf"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::scalar("subject_id"), SlotSpec::path("subjects_dir")]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::scalar("subject_id"),
            SlotSpec::paths("surfaces"),
            SlotSpec::path("report"),
        ]
    }

    async fn invoke(&self, invocation: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
        let subject = invocation.inputs.string("subject_id")?;
        let bem_dir = invocation.inputs.path("subjects_dir")?.join(&subject).join("bem");
        let surfaces = copy_surfaces(&subject, &bem_dir).await?;

        let report = bem_dir.join(BEM_REPORT);
        tokio::fs::write(&report, bem_report_html(&subject, &surfaces))
            .await
            .map_err(|e| RoutineError::io(&report, e))?;
        tracing::info!(subject = %subject, report = %report.display(), "BEM report written");

        let mut outputs = subject_output(subject);
        outputs.insert("surfaces".to_string(), SlotValue::Paths(surfaces));
        outputs.insert("report".to_string(), SlotValue::Path(report));
        Ok(outputs)
    }
}

async fn copy_surfaces(subject: &str, bem_dir: &Path) -> Result<Vec<PathBuf>, RoutineError> {
    let watershed = bem_dir.join("watershed");
    let mut copied = Vec::with_capacity(BEM_SURFACES.len());
    for surface in BEM_SURFACES {
        let source = watershed.join(format!("{}_{}_surface", subject, surface));
        if !source.is_file() {
            return Err(RoutineError::MissingOutput {
                routine: "watershed_bem".to_string(),
                path: source,
            });
        }
        let target = bem_dir.join(format!("{}.surf", surface));
        tokio::fs::copy(&source, &target)
            .await
            .map_err(|e| RoutineError::io(&target, e))?;
        copied.push(target);
    }
    Ok(copied)
}

fn subject_output(subject: String) -> RoutineOutputs {
    RoutineOutputs::from([("subject_id".to_string(), SlotValue::scalar(subject))])
}
