use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const APP: &str = "cephbox";

/// Keeps the background writer alive; dropping it would lose buffered lines.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Log to `<state dir>/cephbox/cephbox.log`, filtered by `RUST_LOG` (default
/// `info`). With `verbose`, the same lines also go to stderr.
///
/// Calling it again after a successful install is a no-op.
pub fn init(verbose: bool) -> Result<()> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let path = log_file()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("Log path {} has no parent", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("Log path {} has no file name", path.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        dir, file_name,
    ));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false);
    let stderr_layer = verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let _ = GUARD.set(guard);
    Ok(())
}

/// `$XDG_STATE_HOME`, then `~/.local/state`, then the working directory.
fn log_file() -> Result<PathBuf> {
    let state_dir = std::env::var_os("XDG_STATE_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| home::home_dir().map(|h| h.join(".local").join("state")));

    match state_dir {
        Some(dir) => Ok(dir.join(APP).join(format!("{APP}.log"))),
        None => Ok(std::env::current_dir()?.join(format!("{APP}.log"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name() {
        let path = log_file().unwrap();
        assert_eq!(path.file_name().unwrap(), "cephbox.log");
    }

    #[test]
    fn test_log_file_under_app_dir_when_state_dir_known() {
        let path = log_file().unwrap();
        if home::home_dir().is_some() {
            assert!(path.ends_with("cephbox/cephbox.log"));
        }
    }
}
