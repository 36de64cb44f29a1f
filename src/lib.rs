//! Run shell commands and file transfers against ephemeral container
//! sandboxes as if they were remote hosts.
//!
//! A [`Sandbox`] is started on first use: its image is built if the runtime
//! does not have it yet, a placeholder process keeps it alive, and a single
//! worker runs submitted commands in order.

pub mod cmd;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod shell;

pub use config::Config;
pub use error::{Result, SandboxError};
pub use sandbox::{Capture, CommandHandle, ExecOptions, Sandbox, SandboxState, StdinSource};
pub use shell::{Arg, CommandLine};
