//! Typed wrapper around external tool invocations.
//!
//! Every collaborator tool (borg, lsblk, blkid, zerofree, ntfsclone) is run
//! through [`ToolCommand`] so failures carry the tool's name, exit status,
//! and captured stderr instead of a bare exit code.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::process::{Output, Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Failure of an external tool.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The tool could not be started or its output could not be collected.
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The tool ran and exited with a status not accepted as success.
    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl ToolError {
    /// Exit code of a tool that ran to completion, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => *code,
            Self::Spawn { .. } => None,
        }
    }
}

/// Captured output of a successful tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ToolOutput {
    /// True when the tool exited with an accepted non-zero code.
    pub fn is_warning(&self) -> bool {
        self.exit_code != 0
    }
}

/// An external command line, built once and executed later.
///
/// Environment values are never printed: they carry secrets such as the
/// repository passphrase.
#[derive(Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    ok_codes: Vec<i32>,
}

impl ToolCommand {
    /// Create a command for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            ok_codes: vec![0],
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable for the child only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Accept an additional exit code as success.
    pub fn allow_exit_code(mut self, code: i32) -> Self {
        self.ok_codes.push(code);
        self
    }

    /// Program name or path.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, lossily converted for inspection.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    /// Whether an environment variable is set on this command.
    pub fn has_env(&self, key: &str) -> bool {
        self.envs.iter().any(|(k, _)| k == key)
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: io::Error) -> ToolError {
        ToolError::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    fn check(&self, output: Output) -> Result<ToolOutput, ToolError> {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            Some(code) if self.ok_codes.contains(&code) => Ok(ToolOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr,
                exit_code: code,
            }),
            code => Err(ToolError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                code,
                stderr,
            }),
        }
    }

    /// Run the command to completion, capturing stdout and stderr.
    pub async fn output(&self) -> Result<ToolOutput, ToolError> {
        debug!(command = %self, "Executing command");

        let output = self.build()
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        self.check(output)
    }

    /// Run `self | consumer`, returning the consumer's output.
    ///
    /// Both sides must succeed. The consumer's failure is reported first since
    /// a consumer that dies takes the producer down with a broken pipe.
    pub async fn pipe_into(&self, consumer: &ToolCommand) -> Result<ToolOutput, ToolError> {
        debug!(producer = %self, consumer = %consumer, "Executing pipeline");

        let mut producer = self.build()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = producer.stdout.take().ok_or_else(|| {
            self.spawn_error(io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"))
        })?;
        let pipe: Stdio = stdout.try_into().map_err(|e| self.spawn_error(e))?;

        let receiver = consumer.build()
            .stdin(pipe)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| consumer.spawn_error(e))?;

        let (produced, consumed) = tokio::join!(
            producer.wait_with_output(),
            receiver.wait_with_output(),
        );

        let consumed = consumed.map_err(|e| consumer.spawn_error(e))?;
        let produced = produced.map_err(|e| self.spawn_error(e))?;

        let result = consumer.check(consumed)?;
        self.check(produced)?;
        Ok(result)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &self.envs.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_output_captures_stdout() {
        let out = ToolCommand::new("echo").arg("hello").output().await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.is_warning());
    }

    #[tokio::test]
    async fn test_failure_carries_stderr_and_code() {
        let err = sh("echo oops >&2; exit 3").output().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        match err {
            ToolError::Failed { program, stderr, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_allowed_exit_code_is_a_warning() {
        let out = sh("exit 1").allow_exit_code(1).output().await.unwrap();
        assert!(out.is_warning());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = ToolCommand::new("/nonexistent/tool").output().await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
        assert_eq!(err.exit_code(), None);
    }

    #[tokio::test]
    async fn test_env_reaches_child() {
        let out = sh("printf %s \"$SECRET\"").env("SECRET", "s3cr3t").output().await.unwrap();
        assert_eq!(out.stdout, "s3cr3t");
    }

    #[tokio::test]
    async fn test_pipe_into_streams_bytes() {
        let out = sh("printf abcdef")
            .pipe_into(&ToolCommand::new("wc").arg("-c"))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "6");
    }

    #[tokio::test]
    async fn test_pipe_into_reports_producer_failure() {
        let err = sh("printf abc; echo broken >&2; exit 4")
            .pipe_into(&ToolCommand::new("cat"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(4));
    }

    #[tokio::test]
    async fn test_pipe_into_reports_consumer_failure() {
        let err = sh("printf abc")
            .pipe_into(&sh("cat >/dev/null; exit 2"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
    }

    #[test]
    fn test_secrets_are_not_printed() {
        let cmd = ToolCommand::new("borg").arg("info").env("BORG_PASSPHRASE", "hunter2");
        assert_eq!(cmd.to_string(), "borg info");
        assert!(!format!("{:?}", cmd).contains("hunter2"));
        assert!(cmd.has_env("BORG_PASSPHRASE"));
    }
}
