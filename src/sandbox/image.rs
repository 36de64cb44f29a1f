//! Image references and build recipes.

use minijinja::{AutoEscape, Environment, context};

use crate::error::{Result, SandboxError};

/// Prefix shared by every image this crate builds or commits.
pub const IMAGE_PREFIX: &str = "ceph-base-";

/// Derive the cached image name for an OS, optionally a committed snapshot.
///
/// Other tooling looks images up by this name, so the scheme is fixed.
pub fn image_name(os_type: &str, os_version: &str, commit_tag: Option<&str>) -> String {
    let mut name = format!("{}{}-{}", IMAGE_PREFIX, os_type, os_version);
    if let Some(tag) = commit_tag {
        name.push('-');
        name.push_str(tag);
    }
    name.to_lowercase()
}

/// Render a build recipe template.
pub fn render_recipe(
    template: &str,
    os_type: &str,
    os_version: &str,
    install: &str,
) -> Result<String> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_keep_trailing_newline(true);
    env.render_str(
        template,
        context! {
            os_type => os_type,
            os_version => os_version,
            install => install,
        },
    )
    .map_err(|e| SandboxError::BuildFailed {
        image: format!("{}:{}", os_type, os_version),
        stderr: format!("invalid recipe template: {}", e),
    })
}
