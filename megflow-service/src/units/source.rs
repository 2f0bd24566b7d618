// Source Reconstruction Routines
// Inverse solution and morphing of source estimates to a template subject

use super::{
    ArgBindings, CommandRunner, CommandSpec, InvocationContext, Routine, RoutineError,
    RoutineOutputs, SlotSpec, SlotValue, Value,
};
use crate::config::{InverseConfig, MorphConfig};
use crate::resolver::substitute;

use std::path::{Path, PathBuf};

/// Hemisphere file that must exist for every source estimate
const LH_SUFFIX: &str = "-lh.stc";

fn hemisphere_file(stem: &Path) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(LH_SUFFIX);
    PathBuf::from(name)
}

fn expect_file(routine: &str, path: PathBuf) -> Result<PathBuf, RoutineError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(RoutineError::MissingOutput {
            routine: routine.to_string(),
            path,
        })
    }
}

/// Computes one source estimate per condition from the concatenated raw data
///
/// The command is expected to write `{output_prefix}_<condition>-lh.stc`
/// (and its right hemisphere twin) for every configured condition.
#[derive(Debug, Clone)]
pub struct InverseSolution {
    params: InverseConfig,
    subjects_dir: PathBuf,
    command: CommandSpec,
}

impl InverseSolution {
    pub fn new(params: InverseConfig, subjects_dir: impl Into<PathBuf>, command: CommandSpec) -> Self {
        Self {
            params,
            subjects_dir: subjects_dir.into(),
            command,
        }
    }

    fn bindings(&self, invocation: &InvocationContext, subject: &str) -> Result<ArgBindings, RoutineError> {
        let params = &self.params;
        let trans_fname = substitute(&params.trans_fname, |name| {
            (name == "subject_id" || name == "subject").then(|| subject.to_string())
        })
        .map_err(|e| RoutineError::InvalidInput(format!("trans_fname: {}", e)))?;
        let events_id = params
            .events_id
            .iter()
            .map(|(name, code)| (name.clone(), Value::from(*code)))
            .collect();

        Ok(ArgBindings::from_invocation(invocation)
            .with("subjects_dir", SlotValue::Path(self.subjects_dir.clone()))
            .with("output_prefix", SlotValue::Path(invocation.work_dir.join("stc")))
            .with("conditions", SlotValue::scalar(params.conditions.clone()))
            .with("events_id", SlotValue::Scalar(Value::Map(events_id)))
            .with("tmin", SlotValue::scalar(params.tmin))
            .with("tmax", SlotValue::scalar(params.tmax))
            .with("spacing", SlotValue::scalar(params.spacing.as_str()))
            .with("snr", SlotValue::scalar(params.snr))
            .with("method", SlotValue::scalar(params.method.as_str()))
            .with("parcellation", SlotValue::scalar(params.parcellation.as_str()))
            .with("trans_fname", SlotValue::scalar(trans_fname)))
    }
}

#[async_trait::async_trait]
impl Routine for InverseSolution {
    fn name(&self) -> &str {
        "inv_solution"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::scalar("subject"),
            SlotSpec::path("raw_file"),
            SlotSpec::path("event_file"),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::paths("stc_files")]
    }

    async fn invoke(&self, invocation: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
        let subject = invocation.inputs.string("subject")?;
        let bindings = self.bindings(invocation, &subject)?;

        CommandRunner::new()
            .with_env("SUBJECTS_DIR", self.subjects_dir.to_string_lossy())
            .run_spec(self.name(), &self.command, &bindings, invocation)
            .await?;

        let stc_files = self
            .params
            .conditions
            .iter()
            .map(|condition| {
                let stem = invocation.work_dir.join(format!("stc_{}", condition));
                expect_file(self.name(), hemisphere_file(&stem))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RoutineOutputs::from([(
            "stc_files".to_string(),
            SlotValue::Paths(stc_files),
        )]))
    }
}

/// Morphs each condition's source estimate onto the template subject
#[derive(Debug, Clone)]
pub struct MorphSourceEstimate {
    conditions: Vec<String>,
    method: String,
    morph: MorphConfig,
    subjects_dir: PathBuf,
    command: CommandSpec,
}

impl MorphSourceEstimate {
    pub fn new(
        inverse: &InverseConfig,
        morph: MorphConfig,
        subjects_dir: impl Into<PathBuf>,
        command: CommandSpec,
    ) -> Self {
        Self {
            conditions: inverse.conditions.clone(),
            method: inverse.method.clone(),
            morph,
            subjects_dir: subjects_dir.into(),
            command,
        }
    }
}

#[async_trait::async_trait]
impl Routine for MorphSourceEstimate {
    fn name(&self) -> &str {
        "morph_stc"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::scalar("subject"), SlotSpec::paths("stc_files")]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::paths("stc_morphed_files")]
    }

    async fn invoke(&self, invocation: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
        let subject = invocation.inputs.string("subject")?;
        let stc_files = invocation.inputs.paths("stc_files")?;
        if stc_files.len() != self.conditions.len() {
            return Err(RoutineError::InvalidInput(format!(
                "{} source estimates for {} conditions",
                stc_files.len(),
                self.conditions.len()
            )));
        }

        let runner = CommandRunner::new().with_env("SUBJECTS_DIR", self.subjects_dir.to_string_lossy());
        let mut morphed = Vec::with_capacity(stc_files.len());
        for (condition, stc_file) in self.conditions.iter().zip(stc_files) {
            let stem = invocation
                .work_dir
                .join(format!("mne_{}_inverse_morph-{}", self.method, condition));
            let bindings = ArgBindings::from_invocation(invocation)
                .with("stc_file", SlotValue::Path(stc_file.clone()))
                .with("condition", SlotValue::scalar(condition.as_str()))
                .with("output", SlotValue::Path(stem.clone()))
                .with("subject_from", SlotValue::scalar(subject.as_str()))
                .with("subject_to", SlotValue::scalar(self.morph.subject_to.as_str()))
                .with("smooth", SlotValue::scalar(self.morph.smooth))
                .with("subjects_dir", SlotValue::Path(self.subjects_dir.clone()));

            runner
                .run_spec(self.name(), &self.command, &bindings, invocation)
                .await?;
            morphed.push(expect_file(self.name(), hemisphere_file(&stem))?);
            tracing::debug!(subject = %subject, condition = %condition, "source estimate morphed");
        }

        Ok(RoutineOutputs::from([(
            "stc_morphed_files".to_string(),
            SlotValue::Paths(morphed),
        )]))
    }
}
