//! Subprocess execution for external conversion tools.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Default cap on retained stdout/stderr per stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Bytes of stderr quoted in a failure message.
const STDERR_TAIL: usize = 2048;

/// A fully resolved external tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub working_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }

    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Drain a pipe to EOF, retaining at most `limit` bytes.
async fn read_bounded<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!(error = %e, "pipe read ended");
                break;
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Run a tool to completion.
///
/// The child is killed when `timeout` elapses, and also if the returned
/// future is dropped. A non-zero exit becomes a `ConversionBackendError`
/// quoting the end of stderr.
pub async fn run_tool(backend: &str, cmd: &ToolCommand) -> Result<ToolOutput, PipelineError> {
    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cmd.working_dir {
        command.current_dir(dir);
    }

    debug!(backend, program = %cmd.program.display(), args = ?cmd.args_lossy(), "spawning tool");
    let started = Instant::now();
    let mut child = command.spawn().map_err(|e| {
        PipelineError::backend(
            backend,
            format!("failed to spawn {}: {e}", cmd.program.display()),
        )
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let limit = cmd.max_output_bytes;

    let outcome = tokio::time::timeout(cmd.timeout, async {
        tokio::join!(
            child.wait(),
            read_bounded(stdout, limit),
            read_bounded(stderr, limit)
        )
    })
    .await;

    let (status, stdout, stderr) = match outcome {
        Ok(done) => done,
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(backend, error = %e, "failed to kill timed out tool");
            }
            return Err(PipelineError::ConversionTimeout {
                stage: backend.to_owned(),
                timeout: cmd.timeout,
            });
        }
    };

    let status = status.map_err(|e| PipelineError::backend(backend, e.to_string()))?;
    let elapsed = started.elapsed();
    if !status.success() {
        let code = status
            .code()
            .map_or_else(|| "signal".to_owned(), |c| c.to_string());
        return Err(PipelineError::backend(
            backend,
            format!("exit status {code}: {}", tail(stderr.trim(), STDERR_TAIL)),
        ));
    }

    debug!(backend, elapsed_ms = elapsed.as_millis() as u64, "tool finished");
    Ok(ToolOutput {
        stdout,
        stderr,
        elapsed,
    })
}

/// Locate a program on `PATH`, or check an explicit path.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        let suffixed = dir.join(format!(
            "{}{}",
            program.display(),
            std::env::consts::EXE_SUFFIX
        ));
        suffixed.is_file().then_some(suffixed)
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_of_successful_tool() {
        let cmd = ToolCommand::new("sh", Duration::from_secs(5)).args(["-c", "echo converted"]);
        let output = run_tool("sh", &cmd).await.unwrap();
        assert_eq!(output.stdout.trim(), "converted");
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let cmd = ToolCommand::new("sh", Duration::from_secs(5))
            .args(["-c", "echo 'bad mesh' >&2; exit 3"]);
        let err = run_tool("sh", &cmd).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit status 3"), "{message}");
        assert!(message.contains("bad mesh"), "{message}");
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let cmd = ToolCommand::new("sh", Duration::from_millis(100)).args(["-c", "sleep 5"]);
        let started = Instant::now();
        let err = run_tool("sh", &cmd).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConversionTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn output_retention_is_bounded() {
        let cmd = ToolCommand::new("sh", Duration::from_secs(5))
            .args(["-c", "head -c 100000 /dev/zero | tr '\\0' x"])
            .max_output_bytes(1000);
        let output = run_tool("sh", &cmd).await.unwrap();
        assert_eq!(output.stdout.len(), 1000);
    }

    #[tokio::test]
    async fn missing_program_is_backend_error() {
        let cmd = ToolCommand::new("/definitely/not/here", Duration::from_secs(1));
        let err = run_tool("ghost", &cmd).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConversionBackendError { .. }));
    }

    #[test]
    fn resolves_programs_on_path() {
        assert!(resolve_program(Path::new("sh")).is_some());
        assert!(resolve_program(Path::new("arforge-no-such-tool")).is_none());
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        assert_eq!(tail("aé", 1), "");
    }
}
