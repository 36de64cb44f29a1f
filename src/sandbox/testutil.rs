//! A scripted stand-in for the container runtime.
//!
//! `exec` runs the requested argv directly on the host and the staging area
//! is mounted at its own path, so commands behave as if the sandbox were the
//! local machine.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::config::Config;

const FAKE_RUNTIME: &str = r#"#!/bin/bash
STATE="__STATE__"
echo "$*" >> "$STATE/calls.log"
cmd="$1"
shift
case "$cmd" in
  images)
    touch "$STATE/images"
    echo "REPOSITORY TAG IMAGE_ID"
    while read -r img; do
      if [ "$img" = "$1" ]; then echo "$img latest 0123456789ab"; fi
    done < "$STATE/images"
    exit 0
    ;;
  build)
    tag="${1#--tag=}"
    cat > "$STATE/recipe"
    if [ -f "$STATE/fail_build" ]; then echo "build exploded" >&2; exit 1; fi
    echo "$tag" >> "$STATE/images"
    ;;
  run)
    name=""
    while [ $# -gt 0 ]; do
      case "$1" in
        --name) name="$2"; shift 2 ;;
        *) shift ;;
      esac
    done
    if [ -f "$STATE/hang" ]; then exec sleep 30; fi
    if [ -f "$STATE/no_sentinel" ]; then echo "boot failed" >&2; exit 1; fi
    if [ -e "$STATE/live-$name" ]; then echo "$name" >> "$STATE/conflicts"; fi
    touch "$STATE/live-$name"
    rm -f "$STATE/stop-$name"
    echo "booting"
    echo "running"
    while [ ! -f "$STATE/stop-$name" ]; do sleep 0.05; done
    rm -f "$STATE/stop-$name" "$STATE/live-$name"
    echo "shutting down"
    ;;
  exec)
    if [ "$1" = "-i" ]; then shift; fi
    shift
    exec "$@"
    ;;
  stop)
    if [ -f "$STATE/fail_stop" ]; then echo "cannot stop $1" >&2; exit 1; fi
    touch "$STATE/stop-$1"
    ;;
  commit)
    echo "$2" >> "$STATE/images"
    ;;
  cp)
    cp "${1#*:}" "$2" || exit 1
    ;;
  inspect)
    echo "10.0.0.7"
    ;;
  *)
    echo "unknown subcommand: $cmd" >&2
    exit 2
    ;;
esac
"#;

pub struct FakeRuntime {
    dir: TempDir,
    pub config: Config,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();

        let script = dir.path().join("runtime");
        let body = FAKE_RUNTIME.replace("__STATE__", &dir.path().to_string_lossy());
        fs::write(&script, body).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let config = Config {
            program: Some(script.to_string_lossy().to_string()),
            staging_dir: Some(staging.clone()),
            staging_mount: Some(staging.to_string_lossy().to_string()),
            launch_timeout_secs: Some(10),
            ..Default::default()
        };
        Self { dir, config }
    }

    pub fn settings(&self) -> Arc<Config> {
        Arc::new(self.config.clone())
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn program(&self) -> String {
        self.config.program().to_string()
    }

    pub fn staging(&self) -> PathBuf {
        self.config.staging_dir()
    }

    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Calls whose subcommand is `subcommand`.
    pub fn calls_to(&self, subcommand: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split_whitespace().next() == Some(subcommand))
            .collect()
    }

    pub fn recipe(&self) -> String {
        fs::read_to_string(self.path().join("recipe")).unwrap_or_default()
    }

    pub fn add_image(&self, image: &str) {
        let path = self.path().join("images");
        let mut images = fs::read_to_string(&path).unwrap_or_default();
        images.push_str(image);
        images.push('\n');
        fs::write(path, images).unwrap();
    }

    pub fn set_flag(&self, flag: &str) {
        fs::write(self.path().join(flag), "").unwrap();
    }

    /// Names of sandboxes that saw a second `run` while one was still live.
    pub fn conflicts(&self) -> String {
        fs::read_to_string(self.path().join("conflicts")).unwrap_or_default()
    }

    /// Make the placeholder for `name` exit as if it died on its own.
    pub fn kill_placeholder(&self, name: &str) {
        fs::write(self.path().join(format!("stop-{}", name)), "").unwrap();
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}
