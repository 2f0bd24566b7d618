// Command Runner
// Runs external routines as child processes with captured output

use super::{InvocationContext, RoutineError, SlotValue};
use crate::resolver::{substitute, PlaceholderError};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Program, argument template and environment for an external routine
///
/// Arguments may contain `{placeholder}` fields. An argument consisting of a
/// single placeholder bound to a list of paths expands into one argument per
/// path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the child process only
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Substitute placeholders in every argument
    pub fn render_args(&self, bindings: &ArgBindings) -> Result<Vec<String>, PlaceholderError> {
        let mut rendered = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            if let Some(value) = whole_placeholder(arg).and_then(|name| bindings.get(name)) {
                rendered.extend(value.to_args());
                continue;
            }
            rendered.push(substitute(arg, |name| {
                bindings.get(name).map(|value| value.to_args().join(" "))
            })?);
        }
        Ok(rendered)
    }
}

fn whole_placeholder(arg: &str) -> Option<&str> {
    let name = arg.strip_prefix('{')?.strip_suffix('}')?;
    (!name.contains(['{', '}'])).then_some(name.trim())
}

/// Named values available to argument templates
#[derive(Debug, Clone, Default)]
pub struct ArgBindings {
    values: HashMap<String, SlotValue>,
}

impl ArgBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inputs, context axes, `{context_key}` and `{work_dir}` of an invocation
    pub fn from_invocation(invocation: &InvocationContext) -> Self {
        let mut bindings = Self::new();
        for (axis, value) in invocation.context.bindings() {
            bindings.insert(axis.clone(), SlotValue::scalar(value.as_str()));
        }
        bindings.insert("context_key", SlotValue::scalar(invocation.context.key()));
        bindings.insert("work_dir", SlotValue::Path(invocation.work_dir.clone()));
        for (name, value) in invocation.inputs.iter() {
            bindings.insert(name.clone(), value.clone());
        }
        bindings
    }

    pub fn insert(&mut self, name: impl Into<String>, value: SlotValue) {
        self.values.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: SlotValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&SlotValue> {
        self.values.get(name)
    }
}

/// Output collected from a child process
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if the process could not be spawned, timed out or was killed by a signal)
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Tail of stderr (or stdout when stderr is empty) for error reports
    pub fn diagnostic(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
        lines[start..].join("\n")
    }
}

const DIAGNOSTIC_LINES: usize = 20;

/// Callback for handling output lines as they arrive (line, is_stderr)
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Runner for external programs
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    extra_env: BTreeMap<String, String>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment applied to every child (e.g. `FREESURFER_HOME`)
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// Run a program to completion
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        working_dir: &Path,
        timeout: Option<Duration>,
        on_output: Option<OutputCallback>,
    ) -> CommandOutput {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(working_dir);
        cmd.envs(&self.extra_env);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(program, ?args, dir = %working_dir.display(), "spawning external routine");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput {
                    stderr: format!("failed to spawn '{}': {}", program, e),
                    ..CommandOutput::default()
                };
            }
        };

        let stdout_handle = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(collect_lines(stream, false, on_output.clone())));
        let stderr_handle = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(collect_lines(stream, true, on_output)));

        let (wait_result, timed_out) = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => (result, false),
                Err(_) => {
                    let _ = child.kill().await;
                    (child.wait().await, true)
                }
            },
            None => (child.wait().await, false),
        };

        let stdout = join_output(stdout_handle).await;
        let mut stderr = join_output(stderr_handle).await;
        if timed_out {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "process timed out after {:?}",
                timeout.unwrap_or_default()
            ));
        }

        CommandOutput {
            stdout,
            stderr,
            exit_code: if timed_out {
                None
            } else {
                wait_result.ok().and_then(|status| status.code())
            },
            timed_out,
        }
    }

    /// Render a command spec for an invocation, run it in the node's working
    /// directory and fail unless it exits successfully
    pub async fn run_spec(
        &self,
        routine: &str,
        spec: &CommandSpec,
        bindings: &ArgBindings,
        invocation: &InvocationContext,
    ) -> Result<CommandOutput, RoutineError> {
        let args = spec
            .render_args(bindings)
            .map_err(|e| RoutineError::InvalidInput(format!("{}: {}", routine, e)))?;

        let on_output = invocation.output_callback();
        let output = self
            .run(
                &spec.program,
                &args,
                &spec.env,
                &invocation.work_dir,
                spec.timeout(),
                on_output,
            )
            .await;

        if !output.success() {
            return Err(RoutineError::External {
                routine: routine.to_string(),
                exit_code: output.exit_code,
                diagnostic: output.diagnostic(),
            });
        }
        Ok(output)
    }
}

async fn collect_lines<R>(stream: R, is_stderr: bool, on_output: Option<OutputCallback>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(callback) = &on_output {
            callback(&line, is_stderr);
        }
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}

async fn join_output(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::sync::Mutex;

    fn bindings() -> ArgBindings {
        ArgBindings::new()
            .with("subject_id", SlotValue::scalar("sub001"))
            .with(
                "runs",
                SlotValue::Paths(vec![PathBuf::from("/r/run_01.fif"), PathBuf::from("/r/run_02.fif")]),
            )
            .with("output", SlotValue::Path(PathBuf::from("/w/out.fif")))
    }

    #[test]
    fn test_render_args_expands_paths() {
        let spec = CommandSpec::new("concat").args(["--subject", "{subject_id}", "{runs}", "-o", "{output}"]);
        assert_eq!(
            spec.render_args(&bindings()).unwrap(),
            vec![
                "--subject",
                "sub001",
                "/r/run_01.fif",
                "/r/run_02.fif",
                "-o",
                "/w/out.fif"
            ]
        );
    }

    #[test]
    fn test_render_args_embedded_placeholder() {
        let spec = CommandSpec::new("tool").args(["--out={output}", "{subject_id}-trans.fif"]);
        assert_eq!(
            spec.render_args(&bindings()).unwrap(),
            vec!["--out=/w/out.fif", "sub001-trans.fif"]
        );
    }

    #[test]
    fn test_render_args_missing_placeholder() {
        let spec = CommandSpec::new("tool").args(["{session_id}"]);
        assert_eq!(
            spec.render_args(&bindings()),
            Err(PlaceholderError::Missing("session_id".into()))
        );
    }

    #[test]
    fn test_command_spec_deserializes() {
        let spec: CommandSpec = serde_yaml::from_str(
            "program: recon-all\nargs: [-all]\nenv: {OMP_NUM_THREADS: '1'}\ntimeout_secs: 60\n",
        )
        .unwrap();
        assert_eq!(spec.program, "recon-all");
        assert_eq!(spec.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(spec.env["OMP_NUM_THREADS"], "1");
    }

    #[test]
    fn test_diagnostic_prefers_stderr_tail() {
        let output = CommandOutput {
            stdout: "ok".into(),
            stderr: (1..=30).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n"),
            exit_code: Some(1),
            timed_out: false,
        };
        let diagnostic = output.diagnostic();
        assert!(diagnostic.starts_with("line 11"));
        assert!(diagnostic.ends_with("line 30"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_output_and_env() {
        let temp = tempfile::tempdir().unwrap();
        let runner = CommandRunner::new().with_env("SUBJECTS_DIR", "/fs/subjects");
        let args = vec![
            "-c".to_string(),
            "echo $SUBJECTS_DIR; echo warn >&2".to_string(),
        ];

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: OutputCallback = Arc::new(move |line, is_stderr| {
            sink.lock().unwrap().push((line.to_string(), is_stderr));
        });

        let output = runner
            .run("sh", &args, &BTreeMap::new(), temp.path(), None, Some(callback))
            .await;

        assert!(output.success());
        assert_eq!(output.stdout, "/fs/subjects");
        assert_eq!(output.stderr, "warn");
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_failure() {
        let temp = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "echo broken >&2; exit 3".to_string()];
        let output = CommandRunner::new()
            .run("sh", &args, &BTreeMap::new(), temp.path(), None, None)
            .await;

        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.diagnostic(), "broken");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out() {
        let temp = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "exec sleep 5".to_string()];
        let output = CommandRunner::new()
            .run(
                "sh",
                &args,
                &BTreeMap::new(),
                temp.path(),
                Some(Duration::from_millis(100)),
                None,
            )
            .await;

        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert!(output.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let temp = tempfile::tempdir().unwrap();
        let output = CommandRunner::new()
            .run(
                "megflow-no-such-program",
                &[],
                &BTreeMap::new(),
                temp.path(),
                None,
                None,
            )
            .await;

        assert_eq!(output.exit_code, None);
        assert!(output.stderr.contains("failed to spawn"));
    }
}
