//! Container-backed sandboxes that run commands like remote hosts.

mod command;
mod container;
pub mod image;
pub mod naming;
mod placeholder;
pub mod probe;
mod queue;
pub mod runtime;
mod transfer;

#[cfg(test)]
pub(crate) mod testutil;

pub use command::{Capture, CommandHandle, CommandState, ExecOptions, Sink, StdinSource};
pub use container::{Sandbox, SandboxState};
pub use image::image_name;
pub use naming::{CommandRegistry, NameRegistry, NoopRegistry};
pub use placeholder::run_args;
pub use queue::CommandQueue;
pub use runtime::ContainerRuntime;
