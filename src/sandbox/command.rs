//! One queued shell invocation, its I/O wiring and its completion signal.

use std::fs::{self, File};
use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use tracing::{debug, info, trace, warn};
use wait_timeout::ChildExt;

use crate::cmd::spawn_error;
use crate::error::{Result, SandboxError};
use crate::sandbox::runtime::ContainerRuntime;

/// Caller-owned destination for a command's output.
pub type Sink = Box<dyn Write + Send>;

/// An in-memory sink that can be cloned and read back after the command ends.
#[derive(Debug, Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).to_string()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Where the command's standard input comes from.
#[derive(Debug, Default)]
pub enum StdinSource {
    #[default]
    Null,
    /// A pipe whose write end is handed back on the [`CommandHandle`].
    Pipe,
    File(File),
    Bytes(Vec<u8>),
}

/// Options accepted by [`Sandbox::execute`](crate::sandbox::Sandbox::execute).
pub struct ExecOptions {
    pub stdin: StdinSource,
    pub stdout: Option<Sink>,
    pub stderr: Option<Sink>,
    /// Block until the command finishes. Default: true
    pub wait: bool,
    /// Kill the command if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            stdin: StdinSource::Null,
            stdout: None,
            stderr: None,
            wait: true,
            timeout: None,
        }
    }
}

impl ExecOptions {
    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn stdout(mut self, sink: impl Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    pub fn stderr(mut self, sink: impl Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(sink));
        self
    }

    /// Return as soon as the command is queued.
    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Coarse progress of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Running,
    Finished,
}

#[derive(Debug, Clone)]
enum Outcome {
    Exited(i32),
    TimedOut(Duration),
    SpawnFailed {
        program: String,
        kind: io::ErrorKind,
        message: String,
    },
}

impl Outcome {
    fn to_result(&self, shared: &Shared) -> Result<i32> {
        match self {
            Outcome::Exited(code) => Ok(*code),
            Outcome::TimedOut(timeout) => Err(SandboxError::TimedOut {
                name: shared.sandbox.clone(),
                line: shared.line.clone(),
                timeout: *timeout,
            }),
            Outcome::SpawnFailed {
                program,
                kind,
                message,
            } => Err(spawn_error(program, io::Error::new(*kind, message.clone()))),
        }
    }
}

#[derive(Debug)]
enum Status {
    Pending,
    Running,
    Finished(Outcome),
}

#[derive(Debug)]
struct Shared {
    seq: u64,
    sandbox: String,
    line: String,
    status: Mutex<Status>,
    done: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, status: Status) {
        *self.lock() = status;
        self.done.notify_all();
    }
}

/// The submitter's view of a queued command.
#[derive(Debug)]
pub struct CommandHandle {
    shared: Arc<Shared>,
    stdin: Option<PipeWriter>,
}

impl CommandHandle {
    /// Submission order within the sandbox.
    pub fn seq(&self) -> u64 {
        self.shared.seq
    }

    /// The script line as submitted.
    pub fn line(&self) -> &str {
        &self.shared.line
    }

    pub fn sandbox(&self) -> &str {
        &self.shared.sandbox
    }

    pub fn state(&self) -> CommandState {
        match *self.shared.lock() {
            Status::Pending => CommandState::Pending,
            Status::Running => CommandState::Running,
            Status::Finished(_) => CommandState::Finished,
        }
    }

    /// Write end of a [`StdinSource::Pipe`]. Dropping it closes the command's stdin.
    pub fn take_stdin(&mut self) -> Option<PipeWriter> {
        self.stdin.take()
    }

    /// Block until the command finishes and return its exit status.
    ///
    /// Safe to call any number of times; every call sees the same result.
    pub fn wait(&self) -> Result<i32> {
        let mut status = self.shared.lock();
        if !matches!(*status, Status::Finished(_)) {
            info!("waiting on {}: {}", self.shared.sandbox, self.shared.line);
        }
        while !matches!(*status, Status::Finished(_)) {
            status = self
                .shared
                .done
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &*status {
            Status::Finished(outcome) => outcome.to_result(&self.shared),
            _ => unreachable!("loop exits only once finished"),
        }
    }

    /// Exit status if the command has finished and ran to completion.
    pub fn exit_status(&self) -> Option<i32> {
        match &*self.shared.lock() {
            Status::Finished(Outcome::Exited(code)) => Some(*code),
            _ => None,
        }
    }
}

enum JobStdin {
    Null,
    Pipe(PipeReader),
    File(File),
    Bytes(Vec<u8>),
}

/// The worker's half of a command.
pub(crate) struct Job {
    shared: Arc<Shared>,
    argv: Vec<String>,
    stdin: JobStdin,
    stdout: Option<Sink>,
    stderr: Option<Sink>,
    timeout: Option<Duration>,
    cleanup: Option<PathBuf>,
}

impl Job {
    /// Pair a handle for the submitter with the job the worker will run.
    ///
    /// `argv` runs inside the sandbox; `cleanup` is a host file removed once
    /// the command is finished.
    pub(crate) fn prepare(
        seq: u64,
        sandbox: &str,
        line: String,
        argv: Vec<String>,
        options: ExecOptions,
        cleanup: Option<PathBuf>,
    ) -> io::Result<(CommandHandle, Job)> {
        let shared = Arc::new(Shared {
            seq,
            sandbox: sandbox.to_string(),
            line,
            status: Mutex::new(Status::Pending),
            done: Condvar::new(),
        });

        let (stdin, writer) = match options.stdin {
            StdinSource::Null => (JobStdin::Null, None),
            StdinSource::Pipe => {
                let (reader, writer) = io::pipe()?;
                (JobStdin::Pipe(reader), Some(writer))
            }
            StdinSource::File(file) => (JobStdin::File(file), None),
            StdinSource::Bytes(data) => (JobStdin::Bytes(data), None),
        };

        let handle = CommandHandle {
            shared: Arc::clone(&shared),
            stdin: writer,
        };
        let job = Job {
            shared,
            argv,
            stdin,
            stdout: options.stdout,
            stderr: options.stderr,
            timeout: options.timeout,
            cleanup,
        };
        Ok((handle, job))
    }

    pub(crate) fn seq(&self) -> u64 {
        self.shared.seq
    }

    /// Spawn, drain both output streams, then signal completion.
    pub(crate) fn run(self, runtime: &ContainerRuntime) {
        let Job {
            shared,
            argv,
            stdin,
            stdout,
            stderr,
            timeout,
            cleanup,
        } = self;
        shared.set(Status::Running);

        let outcome = execute(runtime, &shared, argv, stdin, stdout, stderr, timeout);
        if let Some(path) = cleanup
            && let Err(e) = fs::remove_file(&path)
        {
            trace!(path = %path.display(), error = %e, "command:cleanup skipped");
        }
        shared.set(Status::Finished(outcome));
    }
}

fn execute(
    runtime: &ContainerRuntime,
    shared: &Arc<Shared>,
    argv: Vec<String>,
    stdin: JobStdin,
    stdout: Option<Sink>,
    stderr: Option<Sink>,
    timeout: Option<Duration>,
) -> Outcome {
    let mut command = runtime.exec_command(&shared.sandbox, &argv);
    let mut feed = None;
    match stdin {
        JobStdin::Null => {
            command.stdin(Stdio::null());
        }
        JobStdin::Pipe(reader) => {
            command.stdin(Stdio::from(reader));
        }
        JobStdin::File(file) => {
            command.stdin(Stdio::from(file));
        }
        JobStdin::Bytes(data) => {
            command.stdin(Stdio::piped());
            feed = Some(data);
        }
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let spawned = command.spawn();
    drop(command);
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(sandbox = %shared.sandbox, error = %e, "command:spawn failed");
            return Outcome::SpawnFailed {
                program: runtime.program().to_string(),
                kind: e.kind(),
                message: e.to_string(),
            };
        }
    };

    if let (Some(data), Some(mut pipe)) = (feed, child.stdin.take()) {
        thread::spawn(move || {
            if let Err(e) = pipe.write_all(&data) {
                trace!(error = %e, "command:stdin closed early");
            }
        });
    }

    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        let shared = Arc::clone(shared);
        readers.push(thread::spawn(move || pump(out, stdout, &shared, "stdout")));
    }
    if let Some(err) = child.stderr.take() {
        let shared = Arc::clone(shared);
        readers.push(thread::spawn(move || pump(err, stderr, &shared, "stderr")));
    }

    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit) {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                warn!(
                    sandbox = %shared.sandbox,
                    "command timed out after {}s: {}",
                    limit.as_secs_f64(),
                    shared.line
                );
                let _ = child.kill();
                let _ = child.wait();
                // Processes inside the sandbox may still hold the pipes; the
                // readers are left to finish on their own.
                return Outcome::TimedOut(limit);
            }
            Err(e) => Err(e),
        },
        None => child.wait(),
    };

    for reader in readers {
        let _ = reader.join();
    }
    info!(
        "consumed stderr and stdout on {}: {}",
        shared.sandbox, shared.line
    );

    match status {
        Ok(status) => {
            let code = exit_code(status);
            info!("completed on {}: {} (status {})", shared.sandbox, shared.line, code);
            Outcome::Exited(code)
        }
        Err(e) => Outcome::SpawnFailed {
            program: runtime.program().to_string(),
            kind: e.kind(),
            message: e.to_string(),
        },
    }
}

/// Forward every chunk to the sink as soon as it is read, until end-of-stream.
fn pump(mut reader: impl Read, mut sink: Option<Sink>, shared: &Shared, stream: &'static str) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let data = &buf[..n];
                debug!(
                    stream,
                    "command {} {}: {}",
                    shared.sandbox,
                    shared.line,
                    String::from_utf8_lossy(data)
                );
                if let Some(s) = sink.as_mut()
                    && let Err(e) = s.write_all(data).and_then(|_| s.flush())
                {
                    warn!(stream, error = %e, "command:sink write failed, discarding output");
                    sink = None;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
