//! Docker/Podman CLI collaborator.
//!
//! Each method maps onto one runtime subcommand. Argument order matters: the
//! global arguments come first, then the subcommand and its flags.

use std::path::Path;
use std::process::{Child, Command, Stdio};

use tracing::info;

use crate::cmd::{Cmd, spawn_error};
use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::shell::display_argv;

/// Format string handed to `inspect` to read a sandbox's address.
const ADDRESS_FORMAT: &str = "{{.NetworkSettings.IPAddress}}";

#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    program: String,
    global_args: Vec<String>,
}

impl ContainerRuntime {
    pub fn new(program: impl Into<String>, global_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            global_args,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.program(), config.global_args().to_vec())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn cmd(&self, subcommand: &str) -> Cmd {
        Cmd::new(&self.program)
            .args(self.global_args.iter().cloned())
            .arg(subcommand)
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.global_args).arg(subcommand);
        cmd
    }

    /// Fail fast when the runtime executable cannot be found.
    pub fn ensure_available(&self) -> Result<()> {
        which::which(&self.program)
            .map(|_| ())
            .map_err(|e| SandboxError::RuntimeUnavailable(format!("{}: {}", self.program, e)))
    }

    /// Raw `images <filter>` listing.
    pub fn images(&self, filter: &str) -> Result<String> {
        self.cmd("images").arg(filter).run_and_capture_stdout("images")
    }

    /// Whether `image` is present in the local image store.
    pub fn image_exists(&self, image: &str) -> Result<bool> {
        let listing = self.images(image)?;
        Ok(listing
            .lines()
            .any(|line| line.split_whitespace().next() == Some(image)))
    }

    /// Build `tag` from a recipe streamed on stdin.
    pub fn build(&self, tag: &str, recipe: &str) -> Result<()> {
        let output = self
            .cmd("build")
            .arg(format!("--tag={}", tag))
            .arg("-")
            .stdin_bytes(recipe)
            .context(tag)
            .run()?;
        if !output.status.success() {
            return Err(SandboxError::BuildFailed {
                image: tag.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Spawn `run <args...>` with piped output and return the live process.
    pub fn spawn_run(&self, args: &[String]) -> Result<Child> {
        let mut argv: Vec<&str> = vec![self.program.as_str()];
        argv.extend(self.global_args.iter().map(String::as_str));
        argv.push("run");
        argv.extend(args.iter().map(String::as_str));
        info!("running {}", display_argv(&argv));

        self.command("run")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.program, e))
    }

    /// Build (but do not spawn) `exec -i <name> <argv...>`.
    pub fn exec_command(&self, name: &str, argv: &[String]) -> Command {
        let mut cmd = self.command("exec");
        cmd.arg("-i").arg(name).args(argv);
        cmd
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        self.cmd("stop").arg(name).context(name).run_checked("stop")?;
        Ok(())
    }

    pub fn commit(&self, name: &str, image: &str) -> Result<()> {
        self.cmd("commit")
            .args([name, image])
            .context(name)
            .run_checked("commit")?;
        Ok(())
    }

    /// Copy `src` out of the sandbox to `dest` on the host.
    pub fn copy_out(&self, name: &str, src: &str, dest: &Path) -> Result<()> {
        self.cmd("cp")
            .arg(format!("{}:{}", name, src))
            .arg(dest.to_string_lossy().to_string())
            .context(name)
            .run_checked("cp")?;
        Ok(())
    }

    /// Address the sandbox answers on, as reported by `inspect`.
    pub fn inspect_address(&self, name: &str) -> Result<String> {
        self.cmd("inspect")
            .args(["-f", ADDRESS_FORMAT, name])
            .context(name)
            .run_and_capture_stdout("inspect")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testutil::FakeRuntime;

    #[test]
    fn test_global_args_precede_subcommand() {
        let fake = FakeRuntime::new();
        let runtime = ContainerRuntime::new(fake.program(), vec!["--log-level=debug".to_string()]);
        // The fake treats the first argument as the subcommand, so this lands in
        // its unknown branch and fails; the call log shows the order.
        let _ = runtime.stop("box1");
        assert_eq!(fake.calls(), vec!["--log-level=debug stop box1"]);
    }

    #[test]
    fn test_image_exists_matches_whole_name() {
        let fake = FakeRuntime::new();
        let runtime = ContainerRuntime::from_config(&fake.config);
        fake.add_image("ceph-base-ubuntu-14.04-v1");
        assert!(!runtime.image_exists("ceph-base-ubuntu-14.04").unwrap());
        assert!(runtime.image_exists("ceph-base-ubuntu-14.04-v1").unwrap());
    }

    #[test]
    fn test_build_streams_recipe() {
        let fake = FakeRuntime::new();
        let runtime = ContainerRuntime::from_config(&fake.config);
        runtime.build("ceph-base-ubuntu-14.04", "FROM ubuntu:14.04\n").unwrap();
        assert_eq!(fake.recipe(), "FROM ubuntu:14.04\n");
        assert!(fake.calls().contains(&"build --tag=ceph-base-ubuntu-14.04 -".to_string()));
        assert!(runtime.image_exists("ceph-base-ubuntu-14.04").unwrap());
    }

    #[test]
    fn test_build_failure() {
        let fake = FakeRuntime::new();
        fake.set_flag("fail_build");
        let runtime = ContainerRuntime::from_config(&fake.config);
        let err = runtime.build("ceph-base-ubuntu-14.04", "FROM x\n").unwrap_err();
        match err {
            SandboxError::BuildFailed { image, stderr } => {
                assert_eq!(image, "ceph-base-ubuntu-14.04");
                assert_eq!(stderr, "build exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_inspect_address() {
        let fake = FakeRuntime::new();
        let runtime = ContainerRuntime::from_config(&fake.config);
        assert_eq!(runtime.inspect_address("box1").unwrap(), "10.0.0.7");
        assert_eq!(
            fake.calls(),
            vec!["inspect -f {{.NetworkSettings.IPAddress}} box1"]
        );
    }

    #[test]
    fn test_missing_runtime_is_unavailable() {
        let runtime = ContainerRuntime::new("cephbox-no-such-runtime", Vec::new());
        assert!(matches!(
            runtime.ensure_available(),
            Err(SandboxError::RuntimeUnavailable(_))
        ));
    }
}
