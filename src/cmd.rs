use std::io::{self, Write};
use std::process::{Command, Output, Stdio};
use std::thread;

use tracing::{error, info, trace};

use crate::error::{Result, SandboxError};
use crate::shell::display_argv;

/// A builder for one external invocation, logged end to end.
///
/// Every run records the argument vector and both output streams so the log
/// carries an audit trail of what was asked of the runtime.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    context: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            context: None,
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

    /// Feed these bytes on stdin, then close it.
    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Name of the sandbox this invocation is for, used in log lines.
    pub fn context(mut self, name: impl Into<String>) -> Self {
        self.context = Some(name.into());
        self
    }

    fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Execute and return the output regardless of exit status.
    pub fn run(self) -> Result<Output> {
        let argv = display_argv(&self.argv());
        let on = self.context.as_deref().unwrap_or("-");
        info!(sandbox = on, "running {}", argv);
        if let Some(data) = &self.stdin {
            info!(sandbox = on, "stdin: {}", String::from_utf8_lossy(data));
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.program, e))?;

        let writer = match (self.stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => Some(thread::spawn(move || pipe.write_all(&data))),
            _ => None,
        };
        let output = child.wait_with_output()?;
        if let Some(handle) = writer {
            match handle.join() {
                Ok(Err(e)) => trace!(error = %e, "cmd:stdin write ended early"),
                Ok(Ok(())) | Err(_) => {}
            }
        }

        let out = String::from_utf8_lossy(&output.stdout);
        let err = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !err.trim().is_empty() {
            error!(
                sandbox = on,
                status = ?output.status.code(),
                "completed {} on {}: {} {}",
                argv,
                on,
                err.trim(),
                out.trim()
            );
        } else {
            info!(sandbox = on, "completed {} on {}: {}", argv, on, out.trim());
        }
        Ok(output)
    }

    /// Execute and fail with [`SandboxError::RuntimeFailed`] on a non-zero exit.
    pub fn run_checked(self, operation: &str) -> Result<Output> {
        let output = self.run()?;
        if !output.status.success() {
            return Err(SandboxError::RuntimeFailed {
                operation: operation.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Execute and return stdout as a trimmed string.
    pub fn run_and_capture_stdout(self, operation: &str) -> Result<String> {
        let output = self.run_checked(operation)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Map a spawn failure onto the error taxonomy.
pub fn spawn_error(program: &str, err: io::Error) -> SandboxError {
    if err.kind() == io::ErrorKind::NotFound {
        SandboxError::RuntimeUnavailable(format!("{}: {}", program, err))
    } else {
        SandboxError::SpawnFailed {
            program: program.to_string(),
            source: err,
        }
    }
}
