//! OS detection inside a sandbox.
//!
//! Probes run in order and the first one that yields a name wins. A probe
//! whose command fails or prints nothing useful is skipped.

use std::fmt;

use tracing::debug;

use crate::error::Result;
use crate::sandbox::container::Sandbox;

/// One way of asking a sandbox which distribution it runs.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub name: &'static str,
    pub script: &'static str,
    pub parse: fn(&str) -> Option<String>,
}

pub const DEFAULT_PROBES: &[Probe] = &[
    Probe {
        name: "lsb_release",
        script: "lsb_release -is",
        parse: first_line,
    },
    Probe {
        name: "os-release",
        script: "cat /etc/os-release",
        parse: os_release_id,
    },
    Probe {
        name: "redhat-release",
        script: "cat /etc/redhat-release",
        parse: first_word,
    },
];

/// Package family of a distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemType {
    Deb,
    Rpm,
    Other(String),
}

impl SystemType {
    pub fn from_distro(distro: &str) -> Self {
        let distro = distro.to_lowercase();
        if ["ubuntu", "debian"].iter().any(|d| distro.starts_with(d)) {
            SystemType::Deb
        } else if ["centos", "fedora", "redhat", "rhel", "opensuse", "suse", "sles"]
            .iter()
            .any(|d| distro.starts_with(d))
        {
            SystemType::Rpm
        } else {
            SystemType::Other(distro)
        }
    }
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemType::Deb => f.write_str("deb"),
            SystemType::Rpm => f.write_str("rpm"),
            SystemType::Other(s) => f.write_str(s),
        }
    }
}

fn first_line(out: &str) -> Option<String> {
    out.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn first_word(out: &str) -> Option<String> {
    out.split_whitespace().next().map(str::to_string)
}

fn os_release_id(out: &str) -> Option<String> {
    out.lines()
        .find_map(|l| l.trim().strip_prefix("ID="))
        .map(|v| v.trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

/// Lower-cased distribution name, using `probes` in order.
pub fn distro_with(sandbox: &Sandbox, probes: &[Probe]) -> Result<Option<String>> {
    for probe in probes {
        let (status, out) = sandbox.run_capture(probe.script)?;
        if status != 0 {
            debug!(sandbox = %sandbox.name(), probe = probe.name, status, "probe:skipped");
            continue;
        }
        if let Some(found) = (probe.parse)(&out) {
            debug!(sandbox = %sandbox.name(), probe = probe.name, found = %found, "probe:matched");
            return Ok(Some(found.to_lowercase()));
        }
    }
    Ok(None)
}

pub fn distro(sandbox: &Sandbox) -> Result<Option<String>> {
    distro_with(sandbox, DEFAULT_PROBES)
}

pub fn system_type(sandbox: &Sandbox) -> Result<Option<SystemType>> {
    Ok(distro(sandbox)?.map(|d| SystemType::from_distro(&d)))
}
