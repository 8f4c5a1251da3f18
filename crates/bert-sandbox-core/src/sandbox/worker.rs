//! Worker subprocesses: one fresh interpreter per execution.
//!
//! Each worker gets its own rlimits (installed between `fork` and `exec`),
//! its own working directory and a scrubbed environment. The host process
//! never changes its own limits, so concurrent executions cannot interfere.
//!
//! A worker leads its own process group. Once it exits or its deadline
//! fires, the whole group is killed, so nothing it started outlives it.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;

use super::error::EngineError;
use super::limits::ResourceLimits;
use super::outcome::{ErrorKind, ExecutionOutcome};
use super::resolver::ResolvedModel;
use super::validator::AcceptedCode;

/// Python entry point run by every worker.
pub const WORKER_SOURCE: &str = include_str!("worker.py");

/// Cap on captured stderr (user `print` output), logged at debug level.
const STDERR_CAPTURE_BYTES: usize = 64 * 1024;

/// How long the pipes may stay open once the worker's group is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// The explicit namespace handed to a worker: everything user code may see.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext<'a> {
    pub model_id: &'a str,
    pub tokenizer_code: &'a str,
    pub model_code: &'a str,
    pub function_code: &'a str,
    pub input: &'a str,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(code: &'a AcceptedCode, model: &'a ResolvedModel, input: &'a str) -> Self {
        let fragments = code.fragments();
        Self {
            model_id: &model.model_id,
            tokenizer_code: &fragments.tokenizer_code,
            model_code: &fragments.model_code,
            function_code: &fragments.function_code,
            input,
        }
    }
}

/// How to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch<'a> {
    pub python: &'a Path,
    pub workdir: &'a Path,
    pub cache_dir: Option<&'a Path>,
    pub limits: ResourceLimits,
    pub max_reply_bytes: usize,
}

/// Bytes read from a pipe, and whether the cap cut it short.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Everything observed about one finished (or killed) worker.
#[derive(Debug)]
pub struct WorkerExit {
    /// `None` when the wall-clock deadline fired and the worker was killed.
    pub status: Option<ExitStatus>,
    pub reply: Captured,
    pub stderr: Captured,
    pub elapsed: Duration,
    /// The output pipes were still held open after the group was killed.
    pub detached: bool,
}

impl WorkerExit {
    pub fn timed_out(&self) -> bool {
        self.status.is_none()
    }
}

fn build_command(launch: &WorkerLaunch<'_>) -> Command {
    let mut command = Command::new(launch.python);
    command
        .arg("-B")
        .arg("-c")
        .arg(WORKER_SOURCE)
        .current_dir(launch.workdir)
        .env_clear()
        .env("HOME", launch.workdir)
        .env("TMPDIR", launch.workdir)
        .env("LANG", "C.UTF-8")
        .env("PYTHONDONTWRITEBYTECODE", "1")
        .env("PYTHONUNBUFFERED", "1")
        .env("HF_HUB_OFFLINE", "1")
        .env("TRANSFORMERS_OFFLINE", "1")
        .env("HF_DATASETS_OFFLINE", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    if let Some(path) = std::env::var_os("PATH") {
        command.env("PATH", path);
    }
    if let Some(cache_dir) = launch.cache_dir {
        command.env("HF_HOME", cache_dir);
    }

    let limits = launch.limits;
    // SAFETY: the closure only issues setrlimit(2) calls, which are
    // async-signal-safe, and touches no shared state of the parent.
    unsafe {
        command.pre_exec(move || limits.apply().map_err(std::io::Error::from));
    }
    command
}

/// Read `reader` to EOF, keeping at most `cap` bytes.
///
/// Excess output is drained and dropped so the worker never blocks on a
/// full pipe.
async fn read_capped<R>(mut reader: R, cap: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(captured);
        }
        let room = cap.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
    }
}

/// Write the context and close stdin. A worker that dies before reading
/// it is not an error here; its exit status tells the story.
async fn feed(mut stdin: ChildStdin, payload: &[u8]) -> Result<(), EngineError> {
    let written = async {
        stdin.write_all(payload).await?;
        stdin.shutdown().await
    }
    .await;
    match written {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(EngineError::Pipe(err)),
    }
}

/// Launch a worker, feed it `context` and wait for it under the deadline.
pub async fn run_worker(
    launch: &WorkerLaunch<'_>,
    context: &ExecutionContext<'_>,
) -> Result<WorkerExit, EngineError> {
    let payload = serde_json::to_vec(context).map_err(EngineError::Encode)?;
    let started = Instant::now();

    let mut child = build_command(launch)
        .spawn()
        .map_err(|source| EngineError::Spawn {
            python: PathBuf::from(launch.python),
            source,
        })?;

    let stdin = child.stdin.take().ok_or(EngineError::MissingPipe("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(EngineError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(EngineError::MissingPipe("stderr"))?;

    // The worker leads its own group, so its pid is the group id.
    let group = child.id().map(|id| Pid::from_raw(id as i32));

    let reply_task = tokio::spawn(read_capped(stdout, launch.max_reply_bytes));
    let stderr_task = tokio::spawn(read_capped(stderr, STDERR_CAPTURE_BYTES));

    let waited = tokio::time::timeout(launch.limits.time_limit(), async {
        feed(stdin, &payload).await?;
        child.wait().await.map_err(EngineError::Wait)
    })
    .await;

    // Whatever the worker started dies with it, whether it returned or not.
    if let Some(group) = group {
        kill_group(group);
    }

    let status = match waited {
        Ok(status) => Some(status?),
        Err(_elapsed) => {
            // The group kill already hit the worker; kill() also reaps it.
            child.kill().await.map_err(EngineError::Wait)?;
            None
        }
    };
    let elapsed = started.elapsed();

    let (reply, stderr, detached) = drain(reply_task, stderr_task).await?;

    Ok(WorkerExit {
        status,
        reply,
        stderr,
        elapsed,
        detached,
    })
}

/// SIGKILL every process in `group`. An already empty group is fine.
fn kill_group(group: Pid) {
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            tracing::warn!(group = group.as_raw(), error = %err, "failed to kill worker group")
        }
    }
}

/// Collect both pipe readers, giving up after [`DRAIN_GRACE`].
///
/// A process that escaped the group can keep a pipe open forever; in that
/// case the readers are aborted and the third value is `true`.
async fn drain(
    reply_task: JoinHandle<std::io::Result<Captured>>,
    stderr_task: JoinHandle<std::io::Result<Captured>>,
) -> Result<(Captured, Captured, bool), EngineError> {
    let reply_abort = reply_task.abort_handle();
    let stderr_abort = stderr_task.abort_handle();

    let drained =
        tokio::time::timeout(DRAIN_GRACE, async { (reply_task.await, stderr_task.await) }).await;
    match drained {
        Ok((reply, stderr)) => Ok((collected(reply)?, collected(stderr)?, false)),
        Err(_elapsed) => {
            reply_abort.abort();
            stderr_abort.abort();
            Ok((Captured::default(), Captured::default(), true))
        }
    }
}

fn collected(
    joined: Result<std::io::Result<Captured>, tokio::task::JoinError>,
) -> Result<Captured, EngineError> {
    joined
        .map_err(|err| EngineError::Collect(err.to_string()))?
        .map_err(EngineError::Pipe)
}

/// Turn what a worker left behind into an outcome.
///
/// `Err` means the host side misbehaved (for instance the worker answered
/// with something that is not an outcome line).
pub fn interpret(
    exit: &WorkerExit,
    limits: &ResourceLimits,
) -> Result<ExecutionOutcome, EngineError> {
    let Some(status) = exit.status else {
        return Ok(ExecutionOutcome::failure(
            ErrorKind::TimeoutError,
            format!(
                "execution exceeded the time limit of {}s",
                limits.time_limit_seconds
            ),
        ));
    };

    if exit.detached {
        return Ok(ExecutionOutcome::failure(
            ErrorKind::RuntimeError,
            "worker left a process holding its output open",
        ));
    }

    if exit.reply.truncated {
        return Ok(ExecutionOutcome::failure(
            ErrorKind::ResourceLimitError,
            format!("result exceeds the {} byte reply limit", exit.reply.bytes.len()),
        ));
    }

    let text = String::from_utf8_lossy(&exit.reply.bytes);
    if let Some(line) = text.lines().rev().find(|line| !line.trim().is_empty()) {
        return serde_json::from_str::<ExecutionOutcome>(line)
            .map_err(|err| EngineError::Protocol(format!("unreadable worker reply: {err}")));
    }

    Ok(silent_exit_outcome(status, limits))
}

/// Outcome for a worker that ended without replying.
fn silent_exit_outcome(status: ExitStatus, limits: &ResourceLimits) -> ExecutionOutcome {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signo) = status.signal() {
        let name = Signal::try_from(signo)
            .map(|sig| sig.as_str().to_string())
            .unwrap_or_else(|_| format!("signal {signo}"));
        return match Signal::try_from(signo) {
            Ok(Signal::SIGXCPU) => ExecutionOutcome::failure(
                ErrorKind::TimeoutError,
                format!(
                    "execution exceeded the CPU budget of {}s",
                    limits.cpu_backstop_seconds()
                ),
            ),
            Ok(Signal::SIGXFSZ) => ExecutionOutcome::failure(
                ErrorKind::ResourceLimitError,
                format!(
                    "file size limit of {} bytes exceeded",
                    limits.max_output_file_bytes
                ),
            ),
            Ok(Signal::SIGKILL | Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT) => {
                ExecutionOutcome::failure(
                    ErrorKind::ResourceLimitError,
                    format!("worker terminated by {name}, likely out of memory"),
                )
            }
            _ => ExecutionOutcome::failure(
                ErrorKind::RuntimeError,
                format!("worker terminated by {name}"),
            ),
        };
    }

    ExecutionOutcome::failure(
        ErrorKind::RuntimeError,
        format!(
            "worker exited with status {} before reporting a result",
            status.code().unwrap_or(-1)
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exit_with(status: Option<ExitStatus>, reply: &str) -> WorkerExit {
        WorkerExit {
            status,
            reply: Captured {
                bytes: reply.as_bytes().to_vec(),
                truncated: false,
            },
            stderr: Captured::default(),
            elapsed: Duration::from_millis(5),
            detached: false,
        }
    }

    #[test]
    fn test_killed_on_deadline_is_timeout() {
        let limits = ResourceLimits {
            time_limit_seconds: 3,
            ..Default::default()
        };
        let exit = exit_with(None, "");
        assert!(exit.timed_out());
        let outcome = interpret(&exit, &limits).unwrap();
        assert_eq!(outcome.kind(), Some(ErrorKind::TimeoutError));
        assert!(format!("{outcome:?}").contains("3s"));
    }

    #[test]
    fn test_last_reply_line_wins() {
        let reply = "\n{\"status\": \"success\", \"value\": [1, 2]}\n\n";
        let exit = exit_with(Some(ExitStatus::from_raw(0)), reply);
        let outcome = interpret(&exit, &ResourceLimits::default()).unwrap();
        assert_eq!(outcome, ExecutionOutcome::success(serde_json::json!([1, 2])));
    }

    #[test]
    fn test_garbage_reply_is_a_host_error() {
        let exit = exit_with(Some(ExitStatus::from_raw(0)), "not json\n");
        assert!(matches!(
            interpret(&exit, &ResourceLimits::default()),
            Err(EngineError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_reply_is_a_resource_limit() {
        let mut exit = exit_with(Some(ExitStatus::from_raw(0)), "{\"status\": \"succ");
        exit.reply.truncated = true;
        let outcome = interpret(&exit, &ResourceLimits::default()).unwrap();
        assert_eq!(outcome.kind(), Some(ErrorKind::ResourceLimitError));
    }

    #[test]
    fn test_silent_signals_are_classified() {
        let limits = ResourceLimits::default();
        let cases = [
            (signo(Signal::SIGXCPU), ErrorKind::TimeoutError),
            (signo(Signal::SIGXFSZ), ErrorKind::ResourceLimitError),
            (signo(Signal::SIGKILL), ErrorKind::ResourceLimitError),
            (signo(Signal::SIGSEGV), ErrorKind::ResourceLimitError),
            (signo(Signal::SIGTERM), ErrorKind::RuntimeError),
        ];
        for (signo, expected) in cases {
            // Raw wait status for "terminated by signal": the low 7 bits.
            let exit = exit_with(Some(ExitStatus::from_raw(signo)), "");
            let outcome = interpret(&exit, &limits).unwrap();
            assert_eq!(outcome.kind(), Some(expected), "signal {signo}");
        }
    }

    #[test]
    fn test_silent_nonzero_exit_is_runtime_error() {
        // Raw wait status for exit code 3.
        let exit = exit_with(Some(ExitStatus::from_raw(3 << 8)), "");
        let outcome = interpret(&exit, &ResourceLimits::default()).unwrap();
        match outcome {
            ExecutionOutcome::Failure { kind, message } => {
                assert_eq!(kind, ErrorKind::RuntimeError);
                assert!(message.contains("status 3"));
            }
            other => panic!("expected Failure, got {:?}", other),
        }
    }

    #[test]
    fn test_detached_output_is_a_failure_even_with_a_reply() {
        let mut exit = exit_with(
            Some(ExitStatus::from_raw(0)),
            "{\"status\": \"success\", \"value\": \"done\"}\n",
        );
        exit.detached = true;
        let outcome = interpret(&exit, &ResourceLimits::default()).unwrap();
        assert_eq!(outcome.kind(), Some(ErrorKind::RuntimeError));
    }

    #[test]
    fn test_killing_an_empty_group_is_quiet() {
        // No process group has this id: ESRCH is swallowed.
        kill_group(Pid::from_raw(i32::MAX - 1));
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_a_pipe_held_open() {
        let (held, _writer) = tokio::io::duplex(64);
        let reply_task = tokio::spawn(read_capped(held, 1024));
        let stderr_task = tokio::spawn(read_capped(&b""[..], 1024));

        let started = Instant::now();
        let (reply, stderr, detached) = drain(reply_task, stderr_task).await.unwrap();
        assert!(detached);
        assert!(reply.bytes.is_empty() && stderr.bytes.is_empty());
        assert!(started.elapsed() < DRAIN_GRACE + Duration::from_secs(2));
    }

    fn signo(signal: Signal) -> i32 {
        signal as i32
    }

    #[tokio::test]
    async fn test_read_capped_drains_excess() {
        let data = vec![b'x'; 20_000];
        let captured = read_capped(&data[..], 100).await.unwrap();
        assert_eq!(captured.bytes.len(), 100);
        assert!(captured.truncated);

        let captured = read_capped(&b"small"[..], 100).await.unwrap();
        assert_eq!(captured.bytes, b"small");
        assert!(!captured.truncated);
    }

    #[test]
    fn test_context_serializes_every_binding() {
        let context = ExecutionContext {
            model_id: "bert-base-uncased",
            tokenizer_code: "tokenizer = None",
            model_code: "model = None",
            function_code: "def custom_function(t):\n    return t",
            input: "great product",
        };
        let json = serde_json::to_value(&context).unwrap();
        for key in ["model_id", "tokenizer_code", "model_code", "function_code", "input"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_worker_source_is_embedded() {
        assert!(WORKER_SOURCE.contains("custom_function"));
        assert!(WORKER_SOURCE.contains("_open_reply_channel"));
    }
}
