//! Spawning and supervising local processes.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use swarm_core::prelude::{SwarmError, SwarmResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use crate::command::CommandLine;

/// Time allowed for one-shot commands before they are killed.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How [LocalRunner::spawn] hands back the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Stdout is piped so the caller can stream it line by line until the process exits. The
    /// process is killed if the handle is dropped.
    Blocking,
    /// All stdio is detached and the process is left running on its own.
    NonBlocking,
}

/// Output of a one-shot command that exited successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A process started by the [LocalRunner].
#[derive(Debug)]
pub struct ManagedProcess {
    command: String,
    child: Child,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    exit_code: Option<i32>,
}

impl ManagedProcess {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// OS process id, [None] once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit code, [None] while the process is running.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Next line of output, [None] at end of stream or when stdout is not piped.
    pub async fn next_line(&mut self) -> SwarmResult<Option<String>> {
        let Some(lines) = self.stdout.as_mut() else {
            return Ok(None);
        };

        match lines.next_line().await {
            Ok(line) => Ok(line),
            Err(e) => Err(SwarmError::launch(
                self.command.clone(),
                format!("Failed to read process output: {e}"),
            )),
        }
    }

    /// Check whether the process has exited without blocking.
    pub fn poll(&mut self) -> SwarmResult<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }

        let status = self
            .child
            .try_wait()
            .map_err(|e| self.io_error("Failed to poll process", e))?;
        self.exit_code = status.map(exit_code_of);
        Ok(self.exit_code)
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&mut self) -> SwarmResult<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|e| self.io_error("Failed to wait for process", e))?;
        let code = exit_code_of(status);
        self.exit_code = Some(code);
        Ok(code)
    }

    /// Kill the process and wait for it to go away.
    pub async fn kill(&mut self) -> SwarmResult<()> {
        if self.poll()?.is_some() {
            return Ok(());
        }

        log::debug!("Killing `{}`", self.command);
        self.child
            .kill()
            .await
            .map_err(|e| self.io_error("Failed to kill process", e))?;
        self.wait().await?;
        Ok(())
    }

    fn io_error(&self, what: &str, e: std::io::Error) -> SwarmError {
        SwarmError::launch(self.command.clone(), format!("{what}: {e}"))
    }
}

/// Starts local processes, either to supervise them or to leave them running.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    timeout: Duration,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl LocalRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn spawn(&self, cmd: &CommandLine, mode: WaitMode) -> SwarmResult<ManagedProcess> {
        let mut command = to_command(cmd);
        command.stdin(Stdio::null());
        match mode {
            WaitMode::Blocking => {
                command
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true);
            }
            WaitMode::NonBlocking => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let mut child = start(&mut command, cmd)?;
        let stdout = child
            .stdout
            .take()
            .map(|stdout| BufReader::new(stdout).lines());

        Ok(ManagedProcess {
            command: cmd.to_shell_string(),
            child,
            stdout,
            exit_code: None,
        })
    }

    /// Start a process in the background with stdout and stderr written to `log_path`.
    ///
    /// An existing file is overwritten, so a re-run replaces the output of the previous one and
    /// every concurrent caller must use a path of its own.
    pub fn spawn_logged(&self, cmd: &CommandLine, log_path: &Path) -> SwarmResult<ManagedProcess> {
        let rendered = cmd.to_shell_string();
        let log_error = |e: std::io::Error| {
            SwarmError::launch(
                rendered.clone(),
                format!("Failed to open output file {}: {e}", log_path.display()),
            )
        };
        let stdout = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(log_path)
            .map_err(log_error)?;
        let stderr = stdout.try_clone().map_err(log_error)?;

        let mut command = to_command(cmd);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let child = start(&mut command, cmd)?;
        Ok(ManagedProcess {
            command: rendered,
            child,
            stdout: None,
            exit_code: None,
        })
    }

    /// Run a command to completion, killing it if it outlives the runner's timeout.
    pub async fn run(&self, cmd: &CommandLine) -> SwarmResult<CommandOutput> {
        let rendered = cmd.to_shell_string();
        log::debug!("Executing command {rendered}");

        let mut command = to_command(cmd);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = start(&mut command, cmd)?;

        let mut stdout = tokio::spawn(read_to_string(child.stdout.take()));
        let mut stderr = tokio::spawn(read_to_string(child.stderr.take()));

        // The deadline covers draining the pipes too, a background process can hold them open
        // long after the command itself has exited.
        let finished = tokio::time::timeout(self.timeout, async {
            tokio::join!(child.wait(), &mut stdout, &mut stderr)
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok((status, stdout, stderr)) => {
                let status = status.map_err(|e| {
                    SwarmError::launch(rendered.clone(), format!("Failed to wait for process: {e}"))
                })?;
                (status, stdout.unwrap_or_default(), stderr.unwrap_or_default())
            }
            Err(_) => {
                stdout.abort();
                stderr.abort();
                if let Ok(None) = child.try_wait() {
                    if let Err(e) = child.kill().await {
                        log::warn!("Failed to kill timed out command `{rendered}`: {e}");
                    }
                }
                return Err(SwarmError::Timeout {
                    command: rendered,
                    timeout: self.timeout,
                });
            }
        };

        let exit_code = exit_code_of(status);
        if exit_code != 0 {
            return Err(SwarmError::Command {
                command: rendered,
                host: None,
                exit_code: Some(exit_code),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// [Self::run] for a script that needs a shell, such as pipelines or substitutions.
    pub async fn run_shell(&self, script: &str) -> SwarmResult<CommandOutput> {
        self.run(&CommandLine::shell(script)).await
    }
}

fn to_command(cmd: &CommandLine) -> Command {
    let mut command = Command::new(cmd.program());
    command.args(cmd.arguments());
    command
}

fn start(command: &mut Command, cmd: &CommandLine) -> SwarmResult<Child> {
    let child = command
        .spawn()
        .map_err(|e| SwarmError::launch(cmd.to_shell_string(), e))?;
    log::trace!("Started `{cmd}` with pid {:?}", child.id());
    Ok(child)
}

async fn read_to_string<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            log::warn!("Failed to read process output: {e}");
        }
        out = String::from_utf8_lossy(&buf).into_owned();
    }
    out
}

/// Exit code of a finished process. A process killed by a signal reports `128 + signal`, the
/// way a shell does.
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_collects_output() {
        let runner = LocalRunner::default();

        let output = runner
            .run(&CommandLine::new("echo").arg("hello swarm"))
            .await
            .expect("echo failed");
        assert_eq!(output.stdout, "hello swarm\n");
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_error() {
        let runner = LocalRunner::default();

        let err = runner
            .run_shell("echo broken >&2; exit 3")
            .await
            .unwrap_err();
        match err {
            SwarmError::Command {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_executable_has_no_exit_code() {
        let runner = LocalRunner::default();

        let err = runner
            .run(&CommandLine::new("/non/existent/locust"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SwarmError::Command {
                exit_code: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let runner = LocalRunner::new(Duration::from_millis(200));

        let err = runner
            .run(&CommandLine::new("sleep").arg("30"))
            .await
            .unwrap_err();
        match err {
            SwarmError::Timeout { command, timeout } => {
                assert_eq!(command, "sleep 30");
                assert_eq!(timeout, Duration::from_millis(200));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_covers_output_held_by_background_process() {
        let runner = LocalRunner::new(Duration::from_secs(1));

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            runner.run_shell("sleep 20 & echo started"),
        )
        .await
        .expect("run_shell outlived its own timeout");

        assert!(matches!(result, Err(SwarmError::Timeout { .. })));
    }

    #[tokio::test]
    async fn blocking_spawn_streams_lines() {
        let runner = LocalRunner::default();

        let mut process = runner
            .spawn(&CommandLine::shell("echo one; echo two"), WaitMode::Blocking)
            .expect("failed to spawn");
        let mut lines = Vec::new();
        while let Some(line) = process.next_line().await.unwrap() {
            lines.push(line);
        }

        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(process.wait().await.unwrap(), 0);
        assert_eq!(process.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn non_blocking_spawn_can_be_killed() {
        let runner = LocalRunner::default();

        let mut process = runner
            .spawn(&CommandLine::new("sleep").arg("30"), WaitMode::NonBlocking)
            .expect("failed to spawn");
        assert!(process.pid().is_some());
        assert_eq!(process.poll().unwrap(), None);

        process.kill().await.expect("failed to kill");
        assert_eq!(process.exit_code(), Some(128 + 9));
    }

    #[tokio::test]
    async fn logged_spawn_writes_to_file() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log_path = dir.path().join("worker0.out");
        let runner = LocalRunner::default();

        let mut process = runner
            .spawn_logged(&CommandLine::shell("echo out; echo err >&2"), &log_path)
            .expect("failed to spawn");
        assert_eq!(process.wait().await.unwrap(), 0);

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("out"));
        assert!(content.contains("err"));
    }

    #[tokio::test]
    async fn logged_spawn_overwrites_previous_output() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log_path = dir.path().join("worker0.out");
        std::fs::write(&log_path, "output of an earlier run that is much longer\n").unwrap();
        let runner = LocalRunner::default();

        let mut process = runner
            .spawn_logged(&CommandLine::new("echo").arg("fresh"), &log_path)
            .expect("failed to spawn");
        assert_eq!(process.wait().await.unwrap(), 0);

        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), "fresh\n");
    }
}
