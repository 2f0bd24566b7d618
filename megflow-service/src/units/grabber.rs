// Data Grabber
// File discovery as a graph node

use super::{InvocationContext, Routine, RoutineError, RoutineOutputs, SlotSpec, SlotValue};
use crate::resolver::{FileResolver, PathTemplate};

/// Resolves a path template against the node's execution context
///
/// In single mode the template must match exactly one file and the `files`
/// output is a `Path`; otherwise every match is returned, sorted, as `Paths`.
#[derive(Debug, Clone)]
pub struct DataGrabber {
    template: PathTemplate,
    single: bool,
}

impl DataGrabber {
    pub const OUTPUT: &'static str = "files";

    pub fn single(template: PathTemplate) -> Self {
        Self {
            template,
            single: true,
        }
    }

    pub fn multiple(template: PathTemplate) -> Self {
        Self {
            template,
            single: false,
        }
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }
}

#[async_trait::async_trait]
impl Routine for DataGrabber {
    fn name(&self) -> &str {
        "datasource"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        if self.single {
            vec![SlotSpec::path(Self::OUTPUT)]
        } else {
            vec![SlotSpec::paths(Self::OUTPUT)]
        }
    }

    async fn invoke(&self, invocation: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
        let template = self.template.clone();
        let context = invocation.context.clone();
        let single = self.single;

        // Directory walks block, keep them off the runtime workers
        let value = tokio::task::spawn_blocking(move || {
            if single {
                FileResolver::resolve_one(&template, &context).map(SlotValue::Path)
            } else {
                FileResolver::resolve(&template, &context).map(SlotValue::Paths)
            }
        })
        .await
        .map_err(|e| RoutineError::Panicked(format!("file lookup: {}", e)))??;
        tracing::debug!(
            unit = %invocation.unit_id,
            context = %invocation.context,
            files = value.paths().len(),
            "data grabbed"
        );
        Ok(RoutineOutputs::from([(Self::OUTPUT.to_string(), value)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionContext;
    use crate::resolver::ResolutionError;
    use crate::units::BoundInputs;

    use std::fs;
    use std::path::Path;

    fn invocation(subject: &str) -> InvocationContext {
        InvocationContext::new(
            "datasource",
            ExecutionContext::single("subject_id", subject),
            "/tmp",
            BoundInputs::new(),
        )
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[tokio::test]
    async fn test_single_file() {
        let temp = tempfile::tempdir().unwrap();
        let t1 = temp.path().join("sub001/anatomy/highres001.nii.gz");
        touch(&t1);

        let grabber = DataGrabber::single(PathTemplate::new(
            temp.path(),
            "{subject_id}/anatomy/highres001.nii.gz",
        ));
        assert_eq!(grabber.outputs(), vec![SlotSpec::path("files")]);

        let outputs = grabber.invoke(&invocation("sub001")).await.unwrap();
        assert_eq!(outputs["files"], SlotValue::Path(t1));

        let err = grabber.invoke(&invocation("sub002")).await.unwrap_err();
        assert!(matches!(err, RoutineError::Resolution(ResolutionError::NoMatch { .. })));
    }

    #[tokio::test]
    async fn test_multiple_files_sorted() {
        let temp = tempfile::tempdir().unwrap();
        for run in ["run_03", "run_01", "run_02"] {
            touch(&temp.path().join(format!("sub001/ica/{run}_sss_filt_dsamp_ica.fif")));
        }

        let grabber = DataGrabber::multiple(PathTemplate::new(
            temp.path(),
            "{subject_id}/ica/run_*_sss_filt_dsamp_ica.fif",
        ));
        let outputs = grabber.invoke(&invocation("sub001")).await.unwrap();
        let names: Vec<String> = outputs["files"]
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "run_01_sss_filt_dsamp_ica.fif",
                "run_02_sss_filt_dsamp_ica.fif",
                "run_03_sss_filt_dsamp_ica.fif",
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_lookup_leaves_runtime_responsive() {
        let temp = tempfile::tempdir().unwrap();
        for run in 0..50 {
            touch(&temp.path().join(format!("sub001/meg/run_{run:02}/raw.fif")));
        }
        let grabber = DataGrabber::multiple(PathTemplate::new(
            temp.path(),
            "{subject_id}/meg/*/raw.fif",
        ));

        let ticker = tokio::spawn(async { tokio::task::yield_now().await });
        let outputs = grabber.invoke(&invocation("sub001")).await.unwrap();
        assert_eq!(outputs["files"].paths().len(), 50);
        ticker.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_mode_rejects_ambiguous_match() {
        let temp = tempfile::tempdir().unwrap();
        touch(&temp.path().join("sub001/a.fif"));
        touch(&temp.path().join("sub001/b.fif"));

        let grabber = DataGrabber::single(PathTemplate::new(temp.path(), "{subject_id}/*.fif"));
        let err = grabber.invoke(&invocation("sub001")).await.unwrap_err();
        assert!(matches!(
            err,
            RoutineError::Resolution(ResolutionError::Ambiguous { count: 2, .. })
        ));
    }
}
