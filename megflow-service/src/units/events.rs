// Event Concatenation
// Per-run trigger extraction, delay correction and run concatenation

use super::{
    ArgBindings, CommandRunner, CommandSpec, InvocationContext, Routine, RoutineError,
    RoutineOutputs, SlotSpec, SlotValue,
};
use crate::config::EventsConfig;
use crate::stimulus::{concatenate, delay_in_samples, EventTable, TriggerMask};

use std::path::{Path, PathBuf};

/// Trigger extraction settings shared by every run
#[derive(Debug, Clone, PartialEq)]
pub struct EventParams {
    pub stim_channel: String,
    /// Bits cleared from every trigger code
    pub mask: u32,
    /// Delay between trigger and stimulus onset, in seconds
    pub delay_s: f64,
    pub min_duration_s: f64,
}

impl From<&EventsConfig> for EventParams {
    fn from(config: &EventsConfig) -> Self {
        Self {
            stim_channel: config.stim_channel.clone(),
            mask: config.mask,
            delay_s: config.delay_s,
            min_duration_s: config.min_duration_s,
        }
    }
}

/// Extracts events from every run of a subject and concatenates the runs
///
/// The extraction command is run once per run with `{run}` bound to the
/// run file and `{output}` to the event table it must write. The
/// concatenation command gets `{runs}` and `{output}`.
#[derive(Debug, Clone)]
pub struct ConcatenateEvents {
    params: EventParams,
    extract: CommandSpec,
    concat: CommandSpec,
}

impl ConcatenateEvents {
    pub fn new(params: EventParams, extract: CommandSpec, concat: CommandSpec) -> Self {
        Self {
            params,
            extract,
            concat,
        }
    }

    pub fn params(&self) -> &EventParams {
        &self.params
    }

    /// Extract, mask and delay-correct the events of one run
    async fn run_events(
        &self,
        runner: &CommandRunner,
        invocation: &InvocationContext,
        index: usize,
        run: &Path,
    ) -> Result<(PathBuf, EventTable), RoutineError> {
        let event_file = invocation.work_dir.join(format!("run_{:02}-eve.txt", index));
        let bindings = ArgBindings::from_invocation(invocation)
            .with("run", SlotValue::Path(run.to_path_buf()))
            .with("run_index", SlotValue::scalar(index as u32))
            .with("output", SlotValue::Path(event_file.clone()))
            .with("stim_channel", SlotValue::scalar(self.params.stim_channel.as_str()))
            .with("min_duration", SlotValue::scalar(self.params.min_duration_s));
        runner
            .run_spec("extract_events", &self.extract, &bindings, invocation)
            .await?;

        let content = read_output("extract_events", &event_file).await?;
        let table = EventTable::parse(&content)?.masked(TriggerMask(self.params.mask));
        tokio::fs::write(&event_file, table.to_text())
            .await
            .map_err(|e| RoutineError::io(&event_file, e))?;

        let delay = delay_in_samples(table.sfreq, self.params.delay_s);
        tracing::debug!(
            run = %run.display(),
            events = table.len(),
            delay_samples = delay,
            "run events extracted"
        );
        Ok((event_file, table.shifted(delay)))
    }
}

#[async_trait::async_trait]
impl Routine for ConcatenateEvents {
    fn name(&self) -> &str {
        "concat_event"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::scalar("subject"), SlotSpec::paths("runs")]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::path("raw_file"),
            SlotSpec::path("event_file"),
            SlotSpec::paths("run_event_files"),
        ]
    }

    async fn invoke(&self, invocation: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
        let subject = invocation.inputs.string("subject")?;
        let runs = invocation.inputs.paths("runs")?;
        if runs.is_empty() {
            return Err(RoutineError::InvalidInput(format!(
                "no runs found for subject {}",
                subject
            )));
        }

        let runner = CommandRunner::new();
        let mut run_event_files = Vec::with_capacity(runs.len());
        let mut tables = Vec::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            let (file, table) = self.run_events(&runner, invocation, i + 1, run).await?;
            run_event_files.push(file);
            tables.push(table);
        }

        let combined = concatenate(&tables)?;
        let event_file = invocation
            .work_dir
            .join(format!("{}_sss_filt_ica-raw-eve.txt", subject));
        tokio::fs::write(&event_file, combined.to_text())
            .await
            .map_err(|e| RoutineError::io(&event_file, e))?;

        let raw_file = invocation
            .work_dir
            .join(format!("{}_sss_filt_ica-raw.fif", subject));
        let bindings = ArgBindings::from_invocation(invocation)
            .with("output", SlotValue::Path(raw_file.clone()));
        runner
            .run_spec("concat_raw", &self.concat, &bindings, invocation)
            .await?;
        if !raw_file.is_file() {
            return Err(RoutineError::MissingOutput {
                routine: "concat_raw".to_string(),
                path: raw_file,
            });
        }

        tracing::info!(
            subject = %subject,
            runs = runs.len(),
            events = combined.len(),
            "runs concatenated"
        );

        Ok(RoutineOutputs::from([
            ("raw_file".to_string(), SlotValue::Path(raw_file)),
            ("event_file".to_string(), SlotValue::Path(event_file)),
            ("run_event_files".to_string(), SlotValue::Paths(run_event_files)),
        ]))
    }
}

async fn read_output(routine: &str, path: &Path) -> Result<String, RoutineError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RoutineError::MissingOutput {
            routine: routine.to_string(),
            path: path.to_path_buf(),
        }),
        Err(e) => Err(RoutineError::io(path, e)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::execution::ExecutionContext;
    use crate::stimulus::StimulusError;
    use crate::units::BoundInputs;

    fn params() -> EventParams {
        EventParams::from(&EventsConfig::default())
    }

    /// Run files double as their own event tables; extraction is a copy
    fn routine() -> ConcatenateEvents {
        ConcatenateEvents::new(
            params(),
            CommandSpec::new("cp").args(["{run}", "{output}"]),
            CommandSpec::new("sh").args(["-c", "cat {runs} > {output}"]),
        )
    }

    fn invocation(work_dir: &Path, runs: Vec<PathBuf>) -> InvocationContext {
        let inputs: BoundInputs = [
            ("subject".to_string(), SlotValue::scalar("sub001")),
            ("runs".to_string(), SlotValue::Paths(runs)),
        ]
        .into_iter()
        .collect();
        InvocationContext::new(
            "concat_event",
            ExecutionContext::single("subject_id", "sub001"),
            work_dir,
            inputs,
        )
    }

    fn write_run(dir: &Path, name: &str, first_samp: u64, samples: &[(u64, u32)]) -> PathBuf {
        let mut table = format!("# sfreq: 1000\n# n_samples: 10000\n# first_samp: {first_samp}\n");
        for (sample, code) in samples {
            table.push_str(&format!("{sample} 0 {code}\n"));
        }
        let path = dir.join(name);
        std::fs::write(&path, table).unwrap();
        path
    }

    #[tokio::test]
    async fn test_concatenates_runs_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let work = temp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let runs = vec![
            write_run(temp.path(), "run_01.fif", 0, &[(100, 5), (900, 4357), (1500, 4352)]),
            write_run(temp.path(), "run_02.fif", 50, &[(150, 13), (8000, 17)]),
        ];

        let outputs = routine().invoke(&invocation(&work, runs)).await.unwrap();

        let run_files = outputs["run_event_files"].as_paths().unwrap();
        assert_eq!(run_files[0], work.join("run_01-eve.txt"));
        let run1 = EventTable::parse(&std::fs::read_to_string(&run_files[0]).unwrap()).unwrap();
        // Masked but not delayed; 4357 only adds masked bits to the held 5
        assert_eq!(run1.events.iter().map(|e| (e.sample, e.code)).collect::<Vec<_>>(), vec![(100, 5)]);

        let event_file = outputs["event_file"].as_path().unwrap();
        assert_eq!(event_file, work.join("sub001_sss_filt_ica-raw-eve.txt"));
        let combined = EventTable::parse(&std::fs::read_to_string(event_file).unwrap()).unwrap();
        let samples: Vec<u64> = combined.events.iter().map(|e| e.sample).collect();
        assert_eq!(samples, vec![135, 10000 + 100 + 35, 10000 + 7950 + 35]);
        assert!(combined.is_sorted());

        let raw = outputs["raw_file"].as_path().unwrap();
        assert_eq!(raw, work.join("sub001_sss_filt_ica-raw.fif"));
        assert!(raw.is_file());
    }

    #[tokio::test]
    async fn test_missing_event_table() {
        let temp = tempfile::tempdir().unwrap();
        let routine = ConcatenateEvents::new(
            params(),
            CommandSpec::new("true"),
            CommandSpec::new("true"),
        );
        let run = write_run(temp.path(), "run_01.fif", 0, &[(100, 5)]);

        let err = routine.invoke(&invocation(temp.path(), vec![run])).await.unwrap_err();
        assert!(matches!(
            err,
            RoutineError::MissingOutput { ref routine, .. } if routine == "extract_events"
        ));
    }

    #[tokio::test]
    async fn test_malformed_event_table() {
        let temp = tempfile::tempdir().unwrap();
        let run = temp.path().join("run_01.fif");
        std::fs::write(&run, "100 0 5\n").unwrap();
        let work = temp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let err = routine().invoke(&invocation(&work, vec![run])).await.unwrap_err();
        assert!(matches!(err, RoutineError::Stimulus(StimulusError::MissingHeader("sfreq"))));
    }

    #[tokio::test]
    async fn test_no_runs() {
        let temp = tempfile::tempdir().unwrap();
        let err = routine()
            .invoke(&invocation(temp.path(), Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutineError::InvalidInput(_)));
    }
}
