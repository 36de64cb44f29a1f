use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default build recipe. Rendered with `os_type`, `os_version` and `install`.
pub const DEFAULT_RECIPE: &str = "FROM {{ os_type }}:{{ os_version }}\nRUN {{ install }} \n";

/// Default package-install step baked into every base image.
pub const DEFAULT_INSTALL: &str =
    "apt-get update && apt-get install -y python wget && mkdir /home/ubuntu";

/// Container runtime used to host sandboxes
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    /// Docker (default)
    #[default]
    Docker,
    /// Podman
    Podman,
}

impl SandboxRuntime {
    pub fn program(&self) -> &'static str {
        match self {
            SandboxRuntime::Docker => "docker",
            SandboxRuntime::Podman => "podman",
        }
    }
}

/// Configuration for cephbox, read from ~/.config/cephbox/config.yaml
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Container runtime. Default: docker
    #[serde(default)]
    pub runtime: Option<SandboxRuntime>,

    /// Explicit runtime executable, overriding `runtime`
    #[serde(default)]
    pub program: Option<String>,

    /// Arguments placed before every runtime subcommand
    #[serde(default)]
    pub global_args: Option<Vec<String>>,

    /// DNS server handed to `run` (e.g. the bridge address of a local resolver)
    #[serde(default)]
    pub dns: Option<String>,

    /// Launch sandboxes with `--privileged`. Default: true
    #[serde(default)]
    pub privileged: Option<bool>,

    /// Host directory shared with every sandbox. Default: /tmp
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Where `staging_dir` is mounted inside the sandbox. Default: /tmp/tmp
    #[serde(default)]
    pub staging_mount: Option<String>,

    /// Line printed by the placeholder once the sandbox is up. Default: running
    #[serde(default)]
    pub sentinel: Option<String>,

    /// Seconds to wait for the sentinel. Default: 300
    #[serde(default)]
    pub launch_timeout_secs: Option<u64>,

    /// Per-command deadline in seconds. Default: none
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,

    /// Build recipe template (minijinja)
    #[serde(default)]
    pub recipe: Option<String>,

    /// Package-install step substituted into the recipe
    #[serde(default)]
    pub install: Option<String>,

    /// Program and leading arguments run as `<cmd...> <name> <address>` after start
    #[serde(default)]
    pub register_command: Option<Vec<String>>,

    /// Program and leading arguments run as `<cmd...> <name>` after stop
    #[serde(default)]
    pub unregister_command: Option<Vec<String>>,
}

impl Config {
    pub fn runtime(&self) -> SandboxRuntime {
        self.runtime.clone().unwrap_or_default()
    }

    pub fn program(&self) -> &str {
        self.program
            .as_deref()
            .unwrap_or_else(|| self.runtime().program())
    }

    pub fn global_args(&self) -> &[String] {
        self.global_args.as_deref().unwrap_or(&[])
    }

    pub fn privileged(&self) -> bool {
        self.privileged.unwrap_or(true)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    pub fn staging_mount(&self) -> &str {
        self.staging_mount.as_deref().unwrap_or("/tmp/tmp")
    }

    pub fn sentinel(&self) -> &str {
        self.sentinel.as_deref().unwrap_or("running")
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs.unwrap_or(300))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn recipe(&self) -> &str {
        self.recipe.as_deref().unwrap_or(DEFAULT_RECIPE)
    }

    pub fn install(&self) -> &str {
        self.install.as_deref().unwrap_or(DEFAULT_INSTALL)
    }

    /// Path of a file in the staging area, as seen from inside a sandbox.
    pub fn sandbox_path_for(&self, host_path: &Path) -> String {
        let file_name = host_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{}/{}", self.staging_mount().trim_end_matches('/'), file_name)
    }

    /// Load the config from an explicit path, or the global location.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Self::load_from_path(path)?
            }
            None => Self::load_global()?,
        };
        let config = config.unwrap_or_default();
        debug!(program = config.program(), "config:loaded");
        Ok(config)
    }

    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    /// Load the global configuration file from the XDG config directory.
    fn load_global() -> anyhow::Result<Option<Self>> {
        if let Some(home_dir) = home::home_dir() {
            for name in ["config.yaml", "config.yml"] {
                let path = home_dir.join(".config/cephbox").join(name);
                if path.exists() {
                    return Self::load_from_path(&path);
                }
            }
        }
        Ok(None)
    }
}
