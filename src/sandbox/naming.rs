//! Host name registration for running sandboxes.
//!
//! Registration is best-effort: a failure is logged and the sandbox carries on.

use tracing::{info, warn};

use crate::cmd::Cmd;
use crate::config::Config;

pub trait NameRegistry: Send + Sync {
    fn register(&self, name: &str, address: &str);
    fn unregister(&self, name: &str);
}

/// Registers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

impl NameRegistry for NoopRegistry {
    fn register(&self, _name: &str, _address: &str) {}
    fn unregister(&self, _name: &str) {}
}

/// Runs external programs, e.g. a DNS update helper.
///
/// `register` runs `<register...> <name> <address>` and `unregister` runs
/// `<unregister...> <name>`.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    register: Vec<String>,
    unregister: Vec<String>,
}

impl CommandRegistry {
    pub fn new(register: Vec<String>, unregister: Vec<String>) -> Self {
        Self {
            register,
            unregister,
        }
    }

    fn invoke(&self, base: &[String], extra: &[&str], what: &str, name: &str) {
        let Some((program, args)) = base.split_first() else {
            return;
        };
        let result = Cmd::new(program)
            .args(args.iter().cloned())
            .args(extra.iter().copied())
            .context(name)
            .run_checked(what);
        match result {
            Ok(_) => info!(sandbox = name, "naming:{} done", what),
            Err(e) => warn!(sandbox = name, error = %e, "naming:{} failed", what),
        }
    }
}

impl NameRegistry for CommandRegistry {
    fn register(&self, name: &str, address: &str) {
        self.invoke(&self.register, &[name, address], "register", name);
    }

    fn unregister(&self, name: &str) {
        self.invoke(&self.unregister, &[name], "unregister", name);
    }
}

/// The registry described by `config`, or a no-op one.
pub fn registry_from_config(config: &Config) -> Box<dyn NameRegistry> {
    match (&config.register_command, &config.unregister_command) {
        (None, None) => Box::new(NoopRegistry),
        (register, unregister) => Box::new(CommandRegistry::new(
            register.clone().unwrap_or_default(),
            unregister.clone().unwrap_or_default(),
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records calls for lifecycle tests.
    #[derive(Default)]
    pub struct RecordingRegistry {
        pub events: Mutex<Vec<String>>,
    }

    impl NameRegistry for RecordingRegistry {
        fn register(&self, name: &str, address: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("register {} {}", name, address));
        }

        fn unregister(&self, name: &str) {
            self.events.lock().unwrap().push(format!("unregister {}", name));
        }
    }

    #[test]
    fn test_command_registry_runs_programs() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("dns.log");
        let script = format!("echo \"$0 $*\" >> {}", log.display());
        let registry = CommandRegistry::new(
            vec!["sh".into(), "-c".into(), script.clone(), "add".into()],
            vec!["sh".into(), "-c".into(), script, "del".into()],
        );
        registry.register("box1", "10.0.0.7");
        registry.unregister("box1");
        let lines = std::fs::read_to_string(&log).unwrap();
        assert_eq!(lines, "add box1 10.0.0.7\ndel box1\n");
    }

    #[test]
    fn test_failures_are_swallowed() {
        let registry = CommandRegistry::new(vec!["false".into()], vec!["/nonexistent/dns".into()]);
        registry.register("box1", "10.0.0.7");
        registry.unregister("box1");
    }

    #[test]
    fn test_empty_commands_do_nothing() {
        let registry = CommandRegistry::default();
        registry.register("box1", "10.0.0.7");
        registry.unregister("box1");
    }
}
