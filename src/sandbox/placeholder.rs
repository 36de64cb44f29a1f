//! The long-lived process that keeps a sandbox up.
//!
//! The placeholder prints a sentinel line once the sandbox is initialized and
//! then sleeps. A monitor thread watches its output, fires a one-shot
//! readiness signal on the sentinel, and keeps draining until the process
//! exits at stop time.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStderr, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::sandbox::runtime::ContainerRuntime;

/// Arguments for `run` that launch the placeholder for `name`.
pub fn run_args(name: &str, image: &str, config: &Config) -> Vec<String> {
    let mut args = Vec::new();
    if config.privileged() {
        args.push("--privileged".to_string());
    }
    args.push("--rm=true".to_string());
    args.push("--volume".to_string());
    args.push(format!(
        "{}:{}",
        config.staging_dir().display(),
        config.staging_mount()
    ));
    args.push("--name".to_string());
    args.push(name.to_string());
    if let Some(dns) = &config.dns {
        args.push(format!("--dns={}", dns));
    }
    args.push(image.to_string());
    args.push("bash".to_string());
    args.push("-c".to_string());
    args.push(format!("echo {} ; sleep 1000000", config.sentinel()));
    args
}

pub(crate) struct Placeholder {
    name: String,
    child: Arc<Mutex<Child>>,
    alive: Arc<AtomicBool>,
    monitor: JoinHandle<()>,
}

impl Placeholder {
    /// Spawn the placeholder and block until it reports ready.
    pub(crate) fn launch(
        name: &str,
        image: &str,
        config: &Config,
        runtime: &ContainerRuntime,
    ) -> Result<Self> {
        let mut child = runtime.spawn_run(&run_args(name, image, config))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));

        // Fresh per launch so a stale signal can never satisfy a later start.
        let (ready_tx, ready_rx) = mpsc::sync_channel::<()>(1);
        let alive = Arc::new(AtomicBool::new(true));
        let monitor = {
            let name = name.to_string();
            let sentinel = config.sentinel().to_string();
            let child = Arc::clone(&child);
            let alive = Arc::clone(&alive);
            thread::Builder::new()
                .name(format!("cephbox-placeholder-{}", name))
                .spawn(move || {
                    monitor(&name, &sentinel, stdout, stderr, &child, ready_tx);
                    alive.store(false, Ordering::Release);
                })?
        };

        let timeout = config.launch_timeout();
        match ready_rx.recv_timeout(timeout) {
            Ok(()) => {
                info!(sandbox = name, "start: container {} started", name);
                Ok(Self {
                    name: name.to_string(),
                    child,
                    alive,
                    monitor,
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(sandbox = name, "placeholder not ready after {}s", timeout.as_secs());
                kill(&child, name);
                if let Err(e) = runtime.stop(name) {
                    warn!(sandbox = name, error = %e, "placeholder:stop after timeout failed");
                }
                let _ = monitor.join();
                Err(SandboxError::LaunchTimeout {
                    name: name.to_string(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = monitor.join();
                Err(SandboxError::LaunchFailed {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Whether the placeholder process is still up.
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Flag cleared once the placeholder has exited, readable without `self`.
    pub(crate) fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }

    /// Stop the sandbox and wait for the placeholder to exit.
    ///
    /// When the runtime refuses to stop the container, the client process is
    /// killed so the placeholder still goes away, and the refusal is returned.
    pub(crate) fn terminate(self, runtime: &ContainerRuntime) -> Result<()> {
        let mut result = Ok(());
        if self.is_alive()
            && let Err(e) = runtime.stop(&self.name)
        {
            warn!(sandbox = %self.name, error = %e, "placeholder:runtime stop failed, killing client");
            kill(&self.child, &self.name);
            result = Err(e);
        }
        self.join();
        result
    }

    pub(crate) fn join(self) {
        if self.monitor.join().is_err() {
            error!(sandbox = %self.name, "placeholder:monitor panicked");
        }
    }
}

fn kill(child: &Mutex<Child>, name: &str) {
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = child.kill() {
        warn!(sandbox = name, error = %e, "placeholder:kill failed");
    }
}

fn monitor(
    name: &str,
    sentinel: &str,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    child: &Mutex<Child>,
    ready: SyncSender<()>,
) {
    let stderr_thread = stderr.map(|stream| {
        let name = name.to_string();
        thread::spawn(move || log_lines(stream, &name, "stderr"))
    });

    let mut ready = Some(ready);
    if let Some(stdout) = stdout {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            info!(sandbox = name, "placeholder: {}", line);
            if line.contains(sentinel)
                && let Some(tx) = ready.take()
            {
                let _ = tx.send(());
            }
        }
    }
    // End of output without the sentinel wakes `launch` with a disconnect.
    drop(ready);

    if let Some(handle) = stderr_thread {
        let _ = handle.join();
    }

    let status = child.lock().unwrap_or_else(PoisonError::into_inner).wait();
    match status {
        Ok(status) if status.success() => {
            info!(sandbox = name, "placeholder for {} exited", name)
        }
        Ok(status) => {
            warn!(sandbox = name, status = ?status.code(), "placeholder for {} exited", name)
        }
        Err(e) => error!(sandbox = name, error = %e, "placeholder:wait failed"),
    }
}

fn log_lines(stream: impl Read, name: &str, label: &str) {
    for line in BufReader::new(stream).lines().map_while(|l| l.ok()) {
        info!(sandbox = name, "placeholder {}: {}", label, line);
    }
}
