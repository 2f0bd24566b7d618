// Configuration Models
// Typed, immutable view of a pipeline descriptor

use super::error::{ConfigError, ConfigResult};
use crate::execution::RetentionPolicy;
use crate::units::CommandSpec;
use crate::utils::{default_data_root, expand_tilde};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Root of a pipeline descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Subjects to iterate over, in processing order
    pub subject_ids: Vec<String>,

    /// Recording sessions per subject
    #[serde(default)]
    pub session_ids: Vec<String>,

    /// Subjects listed in `subject_ids` that must not be processed
    #[serde(default)]
    pub exclude_subjects: Vec<String>,

    /// Worker budget: maximum concurrently running node instances
    pub jobs: usize,

    pub paths: PathsConfig,

    #[serde(default)]
    pub anatomy: AnatomyConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub inverse: Option<InverseConfig>,

    #[serde(default)]
    pub morph: MorphConfig,

    #[serde(default)]
    pub routines: RoutinesConfig,

    #[serde(default)]
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Raw MRI dataset root; defaults to `data_root`
    #[serde(default)]
    pub mri_root: Option<PathBuf>,

    /// FreeSurfer subjects directory
    pub subjects_dir: PathBuf,

    /// Artifact writer root; defaults to `<data_root>/reports`
    #[serde(default)]
    pub output_root: Option<PathBuf>,

    #[serde(default)]
    pub freesurfer_home: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnatomyConfig {
    #[serde(default = "default_t1_template")]
    pub t1_template: String,

    #[serde(default = "default_anatomy_workflow")]
    pub workflow_name: String,
}

impl Default for AnatomyConfig {
    fn default() -> Self {
        Self {
            t1_template: default_t1_template(),
            workflow_name: default_anatomy_workflow(),
        }
    }
}

/// Stimulus event extraction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    #[serde(default = "default_runs_root")]
    pub runs_root: String,

    #[serde(default = "default_runs_template")]
    pub runs_template: String,

    #[serde(default = "default_stim_channel")]
    pub stim_channel: String,

    /// Trigger bits cleared before events are kept
    #[serde(default = "default_mask")]
    pub mask: u32,

    /// Projector delay between trigger and stimulus, in seconds
    #[serde(default = "default_delay")]
    pub delay_s: f64,

    #[serde(default = "default_min_duration")]
    pub min_duration_s: f64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            runs_root: default_runs_root(),
            runs_template: default_runs_template(),
            stim_channel: default_stim_channel(),
            mask: default_mask(),
            delay_s: default_delay(),
            min_duration_s: default_min_duration(),
        }
    }
}

/// Inverse solution parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InverseConfig {
    pub conditions: Vec<String>,
    pub events_id: BTreeMap<String, i64>,
    pub tmin: f64,
    pub tmax: f64,
    pub spacing: String,
    pub snr: f64,
    pub method: String,
    pub parcellation: String,
    pub trans_fname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MorphConfig {
    #[serde(default = "default_subject_to")]
    pub subject_to: String,

    #[serde(default = "default_smooth")]
    pub smooth: u32,
}

impl Default for MorphConfig {
    fn default() -> Self {
        Self {
            subject_to: default_subject_to(),
            smooth: default_smooth(),
        }
    }
}

/// Overrides for the external commands each routine runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutinesConfig {
    #[serde(default)]
    pub recon_all: Option<CommandSpec>,
    #[serde(default)]
    pub watershed_bem: Option<CommandSpec>,
    #[serde(default)]
    pub extract_events: Option<CommandSpec>,
    #[serde(default)]
    pub concat_raw: Option<CommandSpec>,
    #[serde(default)]
    pub inverse: Option<CommandSpec>,
    #[serde(default)]
    pub morph: Option<CommandSpec>,
}

fn default_t1_template() -> String {
    "{subject_id}/anatomy/highres001.nii.gz".to_string()
}

fn default_anatomy_workflow() -> String {
    "FS_workflow".to_string()
}

fn default_runs_root() -> String {
    "preprocessing_dsamp_workflow/preproc_meeg_dsamp_pipeline".to_string()
}

fn default_runs_template() -> String {
    "_session_id_*_subject_id_{subject_id}/ica/run_*_sss_filt_dsamp_ica.fif".to_string()
}

fn default_stim_channel() -> String {
    "STI101".to_string()
}

fn default_mask() -> u32 {
    4096 + 256
}

fn default_delay() -> f64 {
    0.0345
}

fn default_min_duration() -> f64 {
    0.015
}

fn default_subject_to() -> String {
    "fsaverage".to_string()
}

fn default_smooth() -> u32 {
    10
}

impl PipelineConfig {
    /// Subjects to process: `subject_ids` minus `exclude_subjects`, order preserved
    pub fn subjects(&self) -> Vec<String> {
        let excluded: HashSet<&str> = self.exclude_subjects.iter().map(String::as_str).collect();
        self.subject_ids
            .iter()
            .filter(|id| !excluded.contains(id.as_str()))
            .cloned()
            .collect()
    }

    pub fn mri_root(&self) -> PathBuf {
        self.paths
            .mri_root
            .clone()
            .unwrap_or_else(|| self.paths.data_root.clone())
    }

    pub fn output_root(&self) -> PathBuf {
        self.paths
            .output_root
            .clone()
            .unwrap_or_else(|| self.paths.data_root.join("reports"))
    }

    /// Directory name of the source reconstruction workflow
    pub fn source_workflow_name(&self) -> ConfigResult<String> {
        let inverse = self.require_inverse()?;
        Ok(format!(
            "source_dsamp_full_reconstruction_{}_{}",
            inverse.method,
            inverse.parcellation.replace('.', "")
        ))
    }

    pub fn require_inverse(&self) -> ConfigResult<&InverseConfig> {
        self.inverse.as_ref().ok_or_else(|| {
            ConfigError::missing_key("inverse").with_suggestion(
                "the source workflow needs an 'inverse:' section with conditions, events_id, tmin, tmax, spacing, snr, method, parcellation and trans_fname",
            )
        })
    }

    pub fn require_freesurfer_home(&self) -> ConfigResult<&PathBuf> {
        self.paths.freesurfer_home.as_ref().ok_or_else(|| {
            ConfigError::missing_key("paths.freesurfer_home")
                .with_suggestion("point 'paths.freesurfer_home' at the FreeSurfer installation")
        })
    }

    /// Command override for a routine that has no usable default
    pub fn require_routine<'a>(
        &self,
        key: &str,
        spec: &'a Option<CommandSpec>,
    ) -> ConfigResult<&'a CommandSpec> {
        spec.as_ref().ok_or_else(|| {
            ConfigError::missing_key(format!("routines.{}", key)).with_suggestion(format!(
                "add 'routines.{}: {{program: <executable>, args: [...]}}'",
                key
            ))
        })
    }

    /// Expand `~` in every configured path
    pub fn expand_paths(&mut self) {
        let paths = &mut self.paths;
        paths.data_root = expand_tilde(&paths.data_root);
        paths.subjects_dir = expand_tilde(&paths.subjects_dir);
        for path in [
            &mut paths.mri_root,
            &mut paths.output_root,
            &mut paths.freesurfer_home,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand_tilde(path);
        }
    }

    /// Semantic checks that serde cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if self.jobs == 0 {
            return Err(ConfigError::invalid_value(
                "jobs",
                "jobs must be a positive number of workers",
            )
            .with_suggestion("set 'jobs: 1' to run sequentially"));
        }

        let mut seen = HashSet::new();
        for id in &self.subject_ids {
            if id.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    "subject_ids",
                    "subject ids must not be empty",
                ));
            }
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::invalid_value(
                    "subject_ids",
                    format!("subject id '{}' is listed more than once", id),
                ));
            }
        }

        for excluded in &self.exclude_subjects {
            if !seen.contains(excluded.as_str()) {
                tracing::warn!(subject = %excluded, "excluded subject is not in subject_ids");
            }
        }

        let required_strings = [
            ("anatomy.t1_template", &self.anatomy.t1_template),
            ("anatomy.workflow_name", &self.anatomy.workflow_name),
            ("events.runs_template", &self.events.runs_template),
            ("events.stim_channel", &self.events.stim_channel),
            ("morph.subject_to", &self.morph.subject_to),
        ];
        for (key, value) in required_strings {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    key,
                    format!("'{}' must not be empty", key),
                ));
            }
        }

        if self.paths.subjects_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid_value(
                "paths.subjects_dir",
                "'paths.subjects_dir' must not be empty",
            ));
        }

        if !(self.events.delay_s.is_finite() && self.events.delay_s >= 0.0) {
            return Err(ConfigError::invalid_value(
                "events.delay_s",
                "the trigger delay must be a non-negative number of seconds",
            ));
        }

        if let Some(inverse) = &self.inverse {
            validate_inverse(inverse)?;
        }

        Ok(())
    }
}

fn validate_inverse(inverse: &InverseConfig) -> ConfigResult<()> {
    if inverse.conditions.is_empty() {
        return Err(ConfigError::invalid_value(
            "inverse.conditions",
            "at least one condition is required",
        ));
    }
    if inverse.tmin >= inverse.tmax {
        return Err(ConfigError::invalid_value(
            "inverse.tmin",
            format!(
                "tmin ({}) must be smaller than tmax ({})",
                inverse.tmin, inverse.tmax
            ),
        ));
    }
    if inverse.snr <= 0.0 {
        return Err(ConfigError::invalid_value(
            "inverse.snr",
            "snr must be positive",
        ));
    }
    for (key, value) in [
        ("inverse.method", &inverse.method),
        ("inverse.spacing", &inverse.spacing),
        ("inverse.parcellation", &inverse.parcellation),
        ("inverse.trans_fname", &inverse.trans_fname),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                key,
                format!("'{}' must not be empty", key),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigErrorKind;

    fn config() -> PipelineConfig {
        PipelineConfig {
            subject_ids: vec!["sub001".into(), "sub002".into(), "sub005".into()],
            session_ids: vec!["01".into()],
            exclude_subjects: vec!["sub005".into()],
            jobs: 4,
            paths: PathsConfig {
                data_root: PathBuf::from("/data"),
                mri_root: None,
                subjects_dir: PathBuf::from("/data/FSF"),
                output_root: None,
                freesurfer_home: None,
            },
            anatomy: AnatomyConfig::default(),
            events: EventsConfig::default(),
            inverse: Some(InverseConfig {
                conditions: vec!["famous".into(), "scrambled".into()],
                events_id: BTreeMap::from([("face/famous".into(), 5), ("scrambled".into(), 17)]),
                tmin: -0.2,
                tmax: 1.0,
                spacing: "oct-6".into(),
                snr: 3.0,
                method: "dSPM".into(),
                parcellation: "aparc.a2009s".into(),
                trans_fname: "{subject_id}-trans.fif".into(),
            }),
            morph: MorphConfig::default(),
            routines: RoutinesConfig::default(),
            retention: RetentionPolicy::KeepAll,
        }
    }

    #[test]
    fn test_subjects_excludes_and_keeps_order() {
        assert_eq!(config().subjects(), vec!["sub001", "sub002"]);
    }

    #[test]
    fn test_source_workflow_name_strips_dots() {
        assert_eq!(
            config().source_workflow_name().unwrap(),
            "source_dsamp_full_reconstruction_dSPM_aparca2009s"
        );
    }

    #[test]
    fn test_default_roots() {
        let cfg = config();
        assert_eq!(cfg.mri_root(), PathBuf::from("/data"));
        assert_eq!(cfg.output_root(), PathBuf::from("/data/reports"));
    }

    #[test]
    fn test_event_defaults() {
        let events = EventsConfig::default();
        assert_eq!(events.mask, 4352);
        assert_eq!(events.delay_s, 0.0345);
        assert_eq!(events.stim_channel, "STI101");
    }

    #[test]
    fn test_validate_rejects_zero_jobs() {
        let mut cfg = config();
        cfg.jobs = 0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind, ConfigErrorKind::InvalidValue);
        assert_eq!(err.key.as_deref(), Some("jobs"));
        assert!(err.suggestion.is_some());
    }

    #[test]
    fn test_validate_rejects_duplicate_subject() {
        let mut cfg = config();
        cfg.subject_ids.push("sub001".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let mut cfg = config();
        if let Some(inverse) = cfg.inverse.as_mut() {
            inverse.tmin = 1.0;
            inverse.tmax = 0.5;
        }
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.key.as_deref(), Some("inverse.tmin"));
    }

    #[test]
    fn test_require_freesurfer_home() {
        let mut cfg = config();
        let err = cfg.require_freesurfer_home().unwrap_err();
        assert_eq!(err.kind, ConfigErrorKind::MissingKey);

        cfg.paths.freesurfer_home = Some(PathBuf::from("/opt/freesurfer"));
        assert!(cfg.require_freesurfer_home().is_ok());
    }

    #[test]
    fn test_require_routine() {
        let cfg = config();
        let err = cfg
            .require_routine("inverse", &cfg.routines.inverse)
            .unwrap_err();
        assert_eq!(err.key.as_deref(), Some("routines.inverse"));
    }
}
