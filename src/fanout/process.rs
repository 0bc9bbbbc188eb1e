// ABOUTME: OS-process isolation for fan-out units and the command specification they run
// ABOUTME: Spawns child processes with configured env and working dir, capturing output and checking exit codes

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error};

use super::{Payload, UnitExecutor, WorkUnit};
use crate::engine::{ActionResult, ErrorKind, ExecutionContext, TaskError};

/// An external command to run as a unit of work.
///
/// ```yaml
/// program: cargo
/// args: ["test", "--workspace"]
/// env:
///   RUST_LOG: info
/// working_dir: /srv/app
/// expected_exit_codes: [0]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Exit codes considered successful. Empty accepts any exit code.
    #[serde(default = "default_exit_codes")]
    pub expected_exit_codes: Vec<i32>,
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            expected_exit_codes: default_exit_codes(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn expect_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.expected_exit_codes = codes.into_iter().collect();
        self
    }

    fn accepts(&self, exit_code: i32) -> bool {
        self.expected_exit_codes.is_empty() || self.expected_exit_codes.contains(&exit_code)
    }

    fn configure_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        if let Some(ref working_dir) = self.working_dir {
            cmd.current_dir(working_dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the future (timeout, abort) must not leave orphans behind
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Run a command to completion.
///
/// The value is `{exit_code, stdout, stderr}`. Spawn failures are `Io`
/// errors; an unexpected exit code is a `Process` error.
pub async fn run_command(spec: &CommandSpec) -> ActionResult {
    debug!("Command: {} {:?}", spec.program, spec.args);

    let output = spec.configure_command().output().await?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    debug!("Command {} exited with code {}", spec.program, exit_code);

    if spec.accepts(exit_code) {
        return Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }));
    }

    let mut message = format!(
        "{} exited with unexpected code {} (expected one of: {:?})",
        spec.program, exit_code, spec.expected_exit_codes
    );
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        message.push_str(": ");
        message.push_str(stderr);
    }
    error!("{}", message);
    Err(TaskError::new(ErrorKind::Process, message))
}

/// Executes each unit as an isolated child process.
///
/// Child processes that have already started are never interrupted by
/// fail-fast; only units still waiting for a worker slot are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessPool;

#[async_trait]
impl UnitExecutor for ProcessPool {
    fn label(&self) -> &'static str {
        "process"
    }

    fn interrupts_in_flight(&self) -> bool {
        false
    }

    async fn execute(&self, unit: WorkUnit, _context: ExecutionContext) -> ActionResult {
        match unit.payload {
            Payload::Command(spec) => run_command(&spec).await,
            Payload::Action(_) => Err(TaskError::new(
                ErrorKind::Unsupported,
                format!(
                    "unit '{}' is an in-process action; process fan-out only runs commands",
                    unit.name
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2"]);
        let value = run_command(&spec).await.unwrap();

        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["stdout"], "hello\n");
        assert_eq!(value["stderr"], "oops\n");
    }

    #[tokio::test]
    async fn test_unexpected_exit_code_is_process_error() {
        let spec = CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = run_command(&spec).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Process);
        assert!(err.message.contains("unexpected code 3"));
        assert!(err.message.ends_with("broken"));
    }

    #[tokio::test]
    async fn test_expected_exit_codes_are_honoured() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "exit 2"])
            .expect_exit_codes([0, 2]);
        let value = run_command(&spec).await.unwrap();
        assert_eq!(value["exit_code"], 2);
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo $GREETING; pwd"])
            .env("GREETING", "hi")
            .current_dir(dir.path());
        let value = run_command(&spec).await.unwrap();

        let stdout = value["stdout"].as_str().unwrap();
        assert!(stdout.starts_with("hi\n"));
        let expected = dir.path().canonicalize().unwrap();
        let reported = PathBuf::from(stdout.lines().nth(1).unwrap())
            .canonicalize()
            .unwrap();
        assert_eq!(reported, expected);
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let spec = CommandSpec::new("definitely-not-a-real-program-wavefront");
        let err = run_command(&spec).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);
    }

    #[test]
    fn test_spec_from_yaml_defaults() {
        let spec: CommandSpec = serde_yaml::from_str("program: ls\nargs: [\"-l\"]").unwrap();
        assert_eq!(spec.expected_exit_codes, vec![0]);
        assert!(spec.env.is_empty());
        assert!(spec.working_dir.is_none());
    }
}
