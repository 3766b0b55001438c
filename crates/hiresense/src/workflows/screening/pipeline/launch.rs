use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to keep reading output once the stage process is gone.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Shared flag a caller flips to abandon a run between or during stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Fully resolved invocation of one stage process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Variables set on top of the inherited environment, backend toggle included.
    pub env: BTreeMap<String, String>,
    pub inherit_env: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub(crate) struct StageOutput {
    pub(crate) status: ExitStatus,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) elapsed: Duration,
}

#[derive(Debug)]
pub(crate) enum LaunchError {
    Spawn(io::Error),
    Wait(io::Error),
    TimedOut { stdout: String, stderr: String },
    Cancelled { stdout: String, stderr: String },
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Starts the process and blocks until it exits, times out, or the run is cancelled.
///
/// The stage runs as the leader of its own process group so that anything it forks is
/// stopped along with it.
pub(crate) fn launch(
    context: &LaunchContext,
    cancel: &CancellationFlag,
) -> Result<StageOutput, LaunchError> {
    let started = Instant::now();

    let mut command = Command::new(&context.program);
    command
        .args(&context.args)
        .current_dir(&context.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !context.inherit_env {
        command.env_clear();
    }
    command.envs(&context.env);
    own_process_group(&mut command);

    let mut child = command.spawn().map_err(LaunchError::Spawn)?;
    let stdout = PipeReader::spawn(child.stdout.take());
    let stderr = PipeReader::spawn(child.stderr.take());

    let outcome = wait_for_exit(&mut child, context.timeout, cancel);
    let stdout = PipeReader::collect(stdout);
    let stderr = PipeReader::collect(stderr);

    match outcome.map_err(LaunchError::Wait)? {
        WaitOutcome::Exited(status) => Ok(StageOutput {
            status,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        }),
        WaitOutcome::TimedOut => Err(LaunchError::TimedOut { stdout, stderr }),
        WaitOutcome::Cancelled => Err(LaunchError::Cancelled { stdout, stderr }),
    }
}

fn wait_for_exit(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: &CancellationFlag,
) -> io::Result<WaitOutcome> {
    let deadline = timeout.map(|limit| Instant::now() + limit);

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(WaitOutcome::Exited(status));
        }
        if cancel.is_cancelled() {
            terminate(child);
            return Ok(WaitOutcome::Cancelled);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            terminate(child);
            return Ok(WaitOutcome::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

fn terminate(child: &mut Child) {
    kill_process_group(child);
    // Reap so the process does not linger as a zombie.
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    let killed = match libc::pid_t::try_from(child.id()) {
        // SAFETY: the child leads its own group from spawn and has not been reaped yet,
        // so the group id cannot have been reused.
        Ok(group) => (unsafe { libc::killpg(group, libc::SIGKILL) }) == 0,
        Err(_) => false,
    };
    if !killed {
        tracing::warn!(
            error = %io::Error::last_os_error(),
            "failed to kill stage process group, killing the stage process only"
        );
        kill_process(child);
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    kill_process(child);
}

fn kill_process(child: &mut Child) {
    if let Err(err) = child.kill() {
        tracing::warn!(error = %err, "failed to kill stage process");
    }
}

/// Output read so far from one stage pipe.
struct PipeReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl PipeReader {
    fn spawn<R>(pipe: Option<R>) -> Option<Self>
    where
        R: Read + Send + 'static,
    {
        let mut pipe = pipe?;
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (finished, done) = mpsc::channel();
        let sink = Arc::clone(&buffer);

        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(read) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..read]),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = finished.send(());
        });

        Some(Self { buffer, done })
    }

    /// Waits briefly for end of stream, then returns whatever has been read. A process
    /// that escaped the stage's group can keep the pipe open; its output is abandoned.
    fn collect(reader: Option<Self>) -> String {
        let Some(reader) = reader else {
            return String::new();
        };
        if reader.done.recv_timeout(OUTPUT_GRACE).is_err() {
            tracing::warn!("stage output still open after the stage ended, keeping partial output");
        }
        let bytes = std::mem::take(
            &mut *reader
                .buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
