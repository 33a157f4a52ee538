//! Subprocess execution with output streaming and cancellation.

use crate::error::{BackrunError, Result};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lines of output kept for error diagnostics.
const DEFAULT_TAIL_LINES: usize = 20;

/// Consecutive read failures tolerated on one output pipe before it is abandoned.
const MAX_READ_ERRORS: usize = 8;

/// A command to run.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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
        self.env.push((key.into(), value.into()));
        self
    }

    /// Printable form used in errors and logs. Secrets travel through `env`, never `args`.
    pub fn display(&self) -> String {
        let program = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string());
        if self.args.is_empty() {
            program
        } else {
            format!("{} {}", program, self.args.join(" "))
        }
    }
}

/// Output of a successful run.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Everything the process wrote to stdout.
    pub stdout: String,
    /// The last lines of combined output.
    pub tail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Runs subprocesses to completion, streaming combined stdout/stderr into a log sink.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    tail_lines: usize,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `spec`, writing each output line to `sink`.
    ///
    /// Returns [`BackrunError::Cancelled`] after killing the process if `cancel` fires, and
    /// [`BackrunError::Process`] with the output tail on a non-zero exit.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        spec: &CommandSpec,
        sink: &mut (dyn Write + Send),
    ) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(BackrunError::Cancelled);
        }

        let command = spec.display();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        // Own process group, so a kill reaches everything the command started.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            BackrunError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to start `{}`: {}", command, e),
            ))
        })?;
        debug!(command = %command, pid = ?child.id(), "Spawned process");
        let mut group = ProcessGroup::of(&child);

        let (tx, mut rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut stdout = String::new();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(self.tail_lines);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    terminate(&mut child, &mut group, &command).await;
                    let _ = writeln!(sink, "[backrun] cancelled");
                    let _ = sink.flush();
                    return Err(BackrunError::Cancelled);
                }
                line = rx.recv() => match line {
                    Some((stream, line)) => {
                        writeln!(sink, "{}", line)?;
                        if stream == Stream::Stdout {
                            stdout.push_str(&line);
                            stdout.push('\n');
                        }
                        if tail.len() == self.tail_lines {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child, &mut group, &command).await;
                return Err(BackrunError::Cancelled);
            }
            status = child.wait() => status?,
        };
        group.release();
        sink.flush()?;

        let tail = Vec::from(tail).join("\n");
        if !status.success() {
            return Err(BackrunError::Process {
                command,
                code: status.code(),
                tail,
            });
        }

        Ok(CommandOutput { stdout, tail })
    }
}

/// Forward newline-terminated output as lossily decoded lines until EOF.
///
/// The pipe is drained even when a line is not valid UTF-8 or a read fails, since a closed
/// pipe kills the writer with SIGPIPE.
async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut errors = 0;
    let mut forwarding = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                errors = 0;
                if forwarding && tx.send((stream, decode_line(&buf))).await.is_err() {
                    forwarding = false;
                }
            }
            Err(e) => {
                errors += 1;
                warn!(error = %e, ?stream, "Failed to read process output");
                if errors >= MAX_READ_ERRORS {
                    break;
                }
            }
        }
    }
}

fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// The process group a spawned command leads.
///
/// Killed on drop unless released, so an abandoned run leaves no descendants behind.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    /// Send SIGKILL to every process in the group.
    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            // SAFETY: kill() has no memory safety preconditions; a negative pid addresses the group.
            if unsafe { libc::kill(-pgid, libc::SIGKILL) } < 0 {
                let e = std::io::Error::last_os_error();
                if e.raw_os_error() != Some(libc::ESRCH) {
                    warn!(pgid, error = %e, "Failed to kill process group");
                }
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }

    /// Forget the group once the command exited on its own.
    fn release(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Kill the process group and reap the leader so no zombie outlives the cancelled task.
async fn terminate(child: &mut Child, group: &mut ProcessGroup, command: &str) {
    group.kill();
    if let Err(e) = child.start_kill() {
        debug!(command = %command, error = %e, "Process already gone");
    }
    match child.wait().await {
        Ok(status) => debug!(command = %command, ?status, "Process terminated"),
        Err(e) => warn!(command = %command, error = %e, "Failed to reap process"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_streams_output_to_sink() {
        let executor = TaskExecutor::new();
        let mut sink = Vec::new();
        let output = executor
            .execute(
                &CancellationToken::new(),
                &sh("echo hello; echo oops >&2"),
                &mut sink,
            )
            .await
            .unwrap();

        assert_eq!(output.stdout, "hello\n");
        let logged = String::from_utf8(sink).unwrap();
        assert!(logged.contains("hello"));
        assert!(logged.contains("oops"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_tail() {
        let executor = TaskExecutor::new();
        let mut sink = Vec::new();
        let err = executor
            .execute(
                &CancellationToken::new(),
                &sh("echo 'Fatal: repository locked' >&2; exit 3"),
                &mut sink,
            )
            .await
            .unwrap_err();

        match err {
            BackrunError::Process { code, tail, .. } => {
                assert_eq!(code, Some(3));
                assert!(tail.contains("repository locked"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let executor = TaskExecutor::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let mut sink = Vec::new();
        let err = executor
            .execute(&cancel, &sh("sleep 30"), &mut sink)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_non_utf8_output_does_not_stop_streaming() {
        let executor = TaskExecutor::new();
        let mut sink = Vec::new();
        let script = "printf 'error: read caf\\351.txt\\n' >&2; sleep 0.2; \
                      i=0; while [ $i -lt 2000 ]; do echo \"skipped $i\" >&2; i=$((i+1)); done; \
                      echo summary";
        let output = executor
            .execute(&CancellationToken::new(), &sh(script), &mut sink)
            .await
            .unwrap();

        assert_eq!(output.stdout, "summary\n");
        let logged = String::from_utf8(sink).unwrap();
        assert!(logged.contains("error: read caf\u{FFFD}.txt"));
        assert!(logged.contains("skipped 1999"));
        assert_eq!(logged.lines().count(), 2002);
    }

    #[test]
    fn test_decode_line_strips_terminators() {
        assert_eq!(decode_line(b"done\r\n"), "done");
        assert_eq!(decode_line(b"partial"), "partial");
        assert_eq!(decode_line(b"\xff\n"), "\u{FFFD}");
    }

    /// Whether `pid` names a live process (zombies count as gone).
    #[cfg(target_os = "linux")]
    fn is_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rfind(')')
                .and_then(|i| stat[i + 1..].trim_start().chars().next())
                .map_or(false, |state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleep.pid");
        let script = format!("sleep 37 & echo $! > {}; wait", pid_file.display());

        let executor = TaskExecutor::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watched = pid_file.clone();
        let grandchild = tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let pid = std::fs::read_to_string(&watched)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                if let Some(pid) = pid {
                    trigger.cancel();
                    return pid;
                }
                assert!(Instant::now() < deadline, "hook never started");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let mut sink = Vec::new();
        let err = executor
            .execute(&cancel, &sh(&script), &mut sink)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        let pid = grandchild.await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_alive(pid) {
            assert!(Instant::now() < deadline, "sleep {} outlived the cancel", pid);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let executor = TaskExecutor::new();
        let mut sink = Vec::new();
        let output = executor
            .execute(
                &CancellationToken::new(),
                &sh("echo $BACKRUN_TEST_VALUE").env("BACKRUN_TEST_VALUE", "42"),
                &mut sink,
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let executor = TaskExecutor::new();
        let mut sink = Vec::new();
        let err = executor
            .execute(
                &CancellationToken::new(),
                &CommandSpec::new("/nonexistent/restic"),
                &mut sink,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackrunError::Io(_)));
    }
}
