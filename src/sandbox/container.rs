//! Sandbox lifecycle: image resolution, launch, readiness, stop and commit.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::sandbox::command::{Capture, CommandHandle, ExecOptions, Job, StdinSource};
use crate::sandbox::image::{image_name, render_recipe};
use crate::sandbox::naming::{NameRegistry, registry_from_config};
use crate::sandbox::placeholder::Placeholder;
use crate::sandbox::queue::CommandQueue;
use crate::sandbox::runtime::ContainerRuntime;
use crate::sandbox::transfer::stage;
use crate::shell::CommandLine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::NotStarted => "not-started",
            SandboxState::Starting => "starting",
            SandboxState::Running => "running",
            SandboxState::Stopping => "stopping",
            SandboxState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Resources owned by a live sandbox. Held for the whole of a transition.
struct Lifecycle {
    placeholder: Option<Placeholder>,
    queue: Option<CommandQueue>,
}

/// What callers may read while a transition is in progress. Only ever locked
/// briefly, and never while waiting on the lifecycle lock.
struct Status {
    state: SandboxState,
    commit_tag: Option<String>,
    alive: Option<Arc<AtomicBool>>,
}

/// A named, container-backed sandbox that runs commands like a remote host.
///
/// Every lifecycle transition and every command submission goes through one
/// lock, so a start can never overlap a stop of the same sandbox and at most
/// one placeholder is live per name at a time. State queries use a separate
/// lock and never wait for a launch or a drain.
pub struct Sandbox {
    name: String,
    os_type: String,
    os_version: String,
    config: Arc<Config>,
    runtime: ContainerRuntime,
    registry: Arc<dyn NameRegistry>,
    lifecycle: Mutex<Lifecycle>,
    status: Mutex<Status>,
}

impl Sandbox {
    pub fn new(
        name: impl Into<String>,
        os_type: impl Into<String>,
        os_version: impl Into<String>,
        config: Arc<Config>,
    ) -> Self {
        let runtime = ContainerRuntime::from_config(&config);
        let registry: Arc<dyn NameRegistry> = Arc::from(registry_from_config(&config));
        Self {
            name: name.into(),
            os_type: os_type.into(),
            os_version: os_version.into(),
            config,
            runtime,
            registry,
            lifecycle: Mutex::new(Lifecycle {
                placeholder: None,
                queue: None,
            }),
            status: Mutex::new(Status {
                state: SandboxState::NotStarted,
                commit_tag: None,
                alive: None,
            }),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn NameRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Start from a previously committed snapshot.
    pub fn with_commit_tag(self, tag: impl Into<String>) -> Self {
        self.status().commit_tag = Some(tag.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn os_type(&self) -> &str {
        &self.os_type
    }

    pub fn os_version(&self) -> &str {
        &self.os_version
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }

    pub fn state(&self) -> SandboxState {
        self.status().state
    }

    pub fn commit_tag(&self) -> Option<String> {
        self.status().commit_tag.clone()
    }

    /// The image this sandbox runs from.
    pub fn image_name(&self) -> String {
        image_name(&self.os_type, &self.os_version, self.commit_tag().as_deref())
    }

    /// Whether the placeholder process is up.
    pub fn is_alive(&self) -> bool {
        self.status()
            .alive
            .as_ref()
            .is_some_and(|alive| alive.load(Ordering::Acquire))
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SandboxState) {
        self.status().state = state;
        debug!(sandbox = %self.name, %state, "sandbox:state");
    }

    fn mark_stopped(&self) {
        {
            let mut status = self.status();
            status.state = SandboxState::Stopped;
            status.alive = None;
        }
        debug!(sandbox = %self.name, state = %SandboxState::Stopped, "sandbox:state");
    }

    /// Build this sandbox's image, returning any failure.
    pub fn build_image(&self) -> Result<()> {
        let image = self.image_name();
        self.build(&image)
    }

    fn build(&self, image: &str) -> Result<()> {
        let recipe = render_recipe(
            self.config.recipe(),
            &self.os_type,
            &self.os_version,
            self.config.install(),
        )?;
        self.runtime.build(image, &recipe)
    }

    /// Make sure the image is present, building it on a cache miss.
    ///
    /// Build failures are logged, not returned: the launch that follows fails
    /// on its own if the image is really missing.
    fn resolve_image(&self, image: &str) {
        match self.runtime.image_exists(image) {
            Ok(true) => {
                info!(sandbox = %self.name, image, "image:cache hit");
                return;
            }
            Ok(false) => info!(sandbox = %self.name, image, "image:cache miss, building"),
            Err(e) => warn!(sandbox = %self.name, image, error = %e, "image:lookup failed, building"),
        }
        if let Err(e) = self.build(image) {
            error!(sandbox = %self.name, image, error = %e, "image:build failed");
        }
    }

    /// Start the sandbox if its placeholder is not alive.
    ///
    /// This is the guard every execution entry point runs first. A placeholder
    /// that died since the last call is torn down and replaced.
    pub fn ensure_running(&self) -> Result<()> {
        let mut lc = self.lock();
        self.ensure_running_locked(&mut lc)
    }

    fn ensure_running_locked(&self, lc: &mut Lifecycle) -> Result<()> {
        if lc.placeholder.as_ref().is_some_and(Placeholder::is_alive) {
            return Ok(());
        }
        self.runtime.ensure_available()?;
        self.set_state(SandboxState::Starting);
        self.resolve_image(&self.image_name());
        self.start_locked(lc)
    }

    /// Launch the placeholder and block until the sandbox is ready.
    ///
    /// Does not build the image; see [`Sandbox::ensure_running`].
    pub fn start(&self) -> Result<()> {
        let mut lc = self.lock();
        self.start_locked(&mut lc)
    }

    fn start_locked(&self, lc: &mut Lifecycle) -> Result<()> {
        match &lc.placeholder {
            Some(p) if p.is_alive() => return Ok(()),
            Some(_) => {
                warn!(sandbox = %self.name, "placeholder exited unexpectedly, restarting");
                self.teardown_locked(lc);
            }
            None => {}
        }

        let image = self.image_name();
        info!(sandbox = %self.name, image = %image, "start: launching");
        self.set_state(SandboxState::Starting);

        let placeholder = match Placeholder::launch(&self.name, &image, &self.config, &self.runtime)
        {
            Ok(p) => p,
            Err(e) => {
                error!(sandbox = %self.name, error = %e, "start: launch failed");
                self.mark_stopped();
                return Err(e);
            }
        };
        let queue = match CommandQueue::start(&self.name, self.runtime.clone()) {
            Ok(q) => q,
            Err(e) => {
                if let Err(stop_err) = placeholder.terminate(&self.runtime) {
                    warn!(sandbox = %self.name, error = %stop_err, "start: cleanup stop failed");
                }
                self.mark_stopped();
                return Err(e.into());
            }
        };
        let alive = placeholder.liveness();
        lc.placeholder = Some(placeholder);
        lc.queue = Some(queue);
        {
            let mut status = self.status();
            status.state = SandboxState::Running;
            status.alive = Some(alive);
        }

        match self.runtime.inspect_address(&self.name) {
            Ok(address) if !address.is_empty() => self.registry.register(&self.name, &address),
            Ok(_) => warn!(sandbox = %self.name, "start: no address to register"),
            Err(e) => warn!(sandbox = %self.name, error = %e, "start: address lookup failed"),
        }
        Ok(())
    }

    /// Drain queued commands, then stop the sandbox and wait for it to exit.
    ///
    /// A sandbox that is not running is left alone. If the runtime refuses to
    /// stop the container, its client is killed, the sandbox still ends up
    /// `Stopped`, and the runtime's error is returned.
    pub fn stop(&self) -> Result<()> {
        let mut lc = self.lock();
        self.stop_locked(&mut lc)
    }

    fn stop_locked(&self, lc: &mut Lifecycle) -> Result<()> {
        let Some(placeholder) = lc.placeholder.take() else {
            return Ok(());
        };
        self.set_state(SandboxState::Stopping);
        info!(sandbox = %self.name, "stop: draining commands");
        if let Some(mut queue) = lc.queue.take() {
            queue.shutdown();
        }
        let result = placeholder.terminate(&self.runtime);
        self.registry.unregister(&self.name);
        self.mark_stopped();
        info!(sandbox = %self.name, "stop: stopped");
        result
    }

    /// Release what is left of a sandbox whose placeholder already exited.
    fn teardown_locked(&self, lc: &mut Lifecycle) {
        if let Some(mut queue) = lc.queue.take() {
            queue.shutdown();
        }
        if let Some(placeholder) = lc.placeholder.take() {
            placeholder.join();
        }
        self.registry.unregister(&self.name);
        self.mark_stopped();
    }

    /// Snapshot the running sandbox as `<image>-<tag>`, then stop it.
    ///
    /// Later starts of this sandbox (or any configured with the same tag) run
    /// from the snapshot.
    pub fn commit(&self, tag: &str) -> Result<()> {
        let mut lc = self.lock();
        if !lc.placeholder.as_ref().is_some_and(Placeholder::is_alive) {
            return Err(SandboxError::NotRunning {
                name: self.name.clone(),
            });
        }
        // Queued work must land in the snapshot.
        if let Some(queue) = &lc.queue {
            queue.drain();
        }
        let image = image_name(&self.os_type, &self.os_version, Some(tag));
        self.runtime.commit(&self.name, &image)?;
        self.status().commit_tag = Some(tag.to_string());
        self.stop_locked(&mut lc)
    }

    /// Queue a command, starting the sandbox first if needed.
    ///
    /// With `wait` set (the default) this returns once the command has
    /// finished and all of its output reached the sinks. A non-zero exit
    /// status is not an error; check [`CommandHandle::wait`].
    ///
    /// [`StdinSource::Pipe`] needs [`ExecOptions::no_wait`]: its writer is
    /// only reachable through the returned handle.
    pub fn execute(
        &self,
        line: impl Into<CommandLine>,
        options: ExecOptions,
    ) -> Result<CommandHandle> {
        if options.wait && matches!(options.stdin, StdinSource::Pipe) {
            return Err(SandboxError::InvalidOptions(
                "a piped stdin requires no_wait(), its writer is on the returned handle"
                    .to_string(),
            ));
        }
        let script = line.into().to_script();
        let wait = options.wait;
        let mut options = options;
        if options.timeout.is_none() {
            options.timeout = self.config.command_timeout();
        }

        let handle = {
            let mut lc = self.lock();
            self.ensure_running_locked(&mut lc)?;
            let queue = lc.queue.as_ref().ok_or_else(|| SandboxError::NotRunning {
                name: self.name.clone(),
            })?;

            let staged = stage(&self.config, "cephbox-cmd-", script.as_bytes())?;
            let argv = vec![
                "bash".to_string(),
                self.config.sandbox_path_for(&staged),
            ];
            info!(sandbox = %self.name, "command {} {}", self.name, script);
            enqueue_staged(queue, &self.name, script, argv, options, staged)?
        };

        if wait {
            handle.wait()?;
        }
        Ok(handle)
    }

    /// Run to completion with no I/O wiring and return the exit status.
    pub fn run(&self, line: impl Into<CommandLine>) -> Result<i32> {
        self.execute(line, ExecOptions::default())?.wait()
    }

    /// Run to completion and return the exit status with captured stdout.
    pub fn run_capture(&self, line: impl Into<CommandLine>) -> Result<(i32, String)> {
        let out = Capture::new();
        let handle = self.execute(line, ExecOptions::default().stdout(out.clone()))?;
        Ok((handle.wait()?, out.text()))
    }
}

/// Queue the job for a staged script. The worker removes the script once the
/// command finishes; if the job never reaches the worker it is removed here.
fn enqueue_staged(
    queue: &CommandQueue,
    sandbox: &str,
    script: String,
    argv: Vec<String>,
    options: ExecOptions,
    staged: PathBuf,
) -> Result<CommandHandle> {
    let queued = Job::prepare(
        queue.next_seq(),
        sandbox,
        script,
        argv,
        options,
        Some(staged.clone()),
    )
    .map_err(SandboxError::from)
    .and_then(|(handle, job)| {
        queue.enqueue(job)?;
        Ok(handle)
    });
    if queued.is_err()
        && let Err(e) = fs::remove_file(&staged)
    {
        trace!(path = %staged.display(), error = %e, "command:staged script already gone");
    }
    queued
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.name)
            .field("os_type", &self.os_type)
            .field("os_version", &self.os_version)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let lc = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if lc.placeholder.is_none() {
            return;
        }
        let mut lc = std::mem::replace(
            lc,
            Lifecycle {
                placeholder: None,
                queue: None,
            },
        );
        if let Err(e) = self.stop_locked(&mut lc) {
            warn!(sandbox = %self.name, error = %e, "stop on drop failed");
        }
    }
}
