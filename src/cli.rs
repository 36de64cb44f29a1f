use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tracing::{info, warn};

use cephbox::sandbox::{ContainerRuntime, image_name, probe};
use cephbox::{CommandLine, Config, ExecOptions, Sandbox, SandboxError};

use crate::spinner::with_spinner;

#[derive(Parser)]
#[command(name = "cephbox")]
#[command(about = "Run commands in ephemeral container sandboxes as if they were remote hosts")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.config/cephbox/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Mirror the log to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ImageArgs {
    /// OS family, e.g. ubuntu
    #[arg(long)]
    os_type: String,

    /// OS version, e.g. 14.04
    #[arg(long)]
    os_version: String,

    /// Start from the snapshot committed under this tag
    #[arg(long)]
    commit_tag: Option<String>,
}

#[derive(Args, Clone)]
struct SandboxArgs {
    /// Sandbox name, also the runtime container name
    #[arg(long, default_value = "cephbox")]
    name: String,

    #[command(flatten)]
    image: ImageArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command in a sandbox and exit with its status
    Exec {
        #[command(flatten)]
        sandbox: SandboxArgs,

        /// Run this shell script verbatim instead of the argument list
        #[arg(long, conflicts_with = "args")]
        script: Option<String>,

        /// Kill the command after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Snapshot the sandbox under this tag afterwards
        #[arg(long)]
        commit: Option<String>,

        /// Print a JSON summary instead of relaying exit status
        #[arg(long)]
        json: bool,

        /// Command and arguments, quoted as needed
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Build the image for an OS, even if it exists
    Build {
        #[command(flatten)]
        image: ImageArgs,
    },

    /// Print the image name for an OS
    ImageName {
        #[command(flatten)]
        image: ImageArgs,
    },

    /// Copy a host file into a sandbox
    Put {
        #[command(flatten)]
        sandbox: SandboxArgs,

        local: PathBuf,
        remote: String,

        /// chmod the file afterwards, e.g. 0644
        #[arg(long)]
        mode: Option<String>,

        /// chown the file afterwards, e.g. ubuntu:ubuntu
        #[arg(long)]
        owner: Option<String>,
    },

    /// Copy a file out of a sandbox and print the host path
    Get {
        #[command(flatten)]
        sandbox: SandboxArgs,

        remote: String,

        /// Host directory for the copy
        #[arg(long, default_value = "/tmp")]
        dest_dir: PathBuf,
    },

    /// Archive a sandbox directory into a .tar.gz on the host
    Tar {
        #[command(flatten)]
        sandbox: SandboxArgs,

        remote_dir: String,
        destination: PathBuf,

        /// Run tar under sudo
        #[arg(long)]
        sudo: bool,
    },

    /// Print the distribution and package family of a sandbox
    Probe {
        #[command(flatten)]
        sandbox: SandboxArgs,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

fn open(args: &SandboxArgs, config: &Arc<Config>) -> Sandbox {
    let sandbox = Sandbox::new(
        &args.name,
        &args.image.os_type,
        &args.image.os_version,
        Arc::clone(config),
    );
    match &args.image.commit_tag {
        Some(tag) => sandbox.with_commit_tag(tag),
        None => sandbox,
    }
}

/// Stop the container on Ctrl-C so in-flight commands return and the normal
/// teardown path runs.
fn install_interrupt_handler(name: &str, config: &Config) -> Result<()> {
    let runtime = ContainerRuntime::from_config(config);
    let name = name.to_string();
    ctrlc::set_handler(move || {
        warn!(sandbox = %name, "interrupted, stopping sandbox");
        if let Err(e) = runtime.stop(&name) {
            warn!(sandbox = %name, error = %e, "stop on interrupt failed");
        }
    })
    .context("Failed to install interrupt handler")
}

/// Start the sandbox, run `op`, and always stop it afterwards.
fn with_sandbox<T>(
    args: &SandboxArgs,
    config: &Arc<Config>,
    op: impl FnOnce(&Sandbox) -> Result<T>,
) -> Result<T> {
    let sandbox = open(args, config);
    install_interrupt_handler(sandbox.name(), config)?;
    with_spinner(&format!("Starting sandbox {}", sandbox.name()), || {
        sandbox.ensure_running()
    })
    .with_context(|| format!("Failed to start sandbox {}", sandbox.name()))?;

    let result = op(&sandbox);
    let stopped = sandbox
        .stop()
        .with_context(|| format!("Failed to stop sandbox {}", sandbox.name()));
    let value = result?;
    stopped?;
    Ok(value)
}

pub fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(Config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Exec {
            sandbox,
            script,
            timeout,
            commit,
            json,
            args,
        } => {
            let line = match script {
                Some(script) => CommandLine::Script(script),
                None if args.is_empty() => anyhow::bail!("Nothing to run"),
                None => CommandLine::args(args),
            };
            let status = with_sandbox(&sandbox, &config, |sb| {
                let mut options = ExecOptions::default()
                    .stdout(io::stdout())
                    .stderr(io::stderr());
                if let Some(secs) = timeout {
                    options = options.timeout(std::time::Duration::from_secs(secs));
                }
                let status = sb.execute(line, options)?.wait()?;
                if let Some(tag) = &commit {
                    with_spinner(&format!("Committing {}", sb.name()), || sb.commit(tag))?;
                }
                Ok((status, sb.image_name()))
            });

            let (status, image) = match status {
                Err(e) if json => {
                    let kind = e.downcast_ref::<SandboxError>().map(SandboxError::kind);
                    println!(
                        "{}",
                        serde_json::json!({
                            "name": sandbox.name,
                            "error": format!("{:#}", e),
                            "kind": kind,
                        })
                    );
                    std::process::exit(1);
                }
                other => other?,
            };
            info!(sandbox = %sandbox.name, status, "exec finished");
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "name": sandbox.name,
                        "image": image,
                        "exit_status": status,
                    })
                );
                return Ok(());
            }
            if status != 0 {
                std::process::exit(status.clamp(1, 255));
            }
            Ok(())
        }
        Commands::Build { image } => {
            let sandbox = Sandbox::new(
                "cephbox-build",
                &image.os_type,
                &image.os_version,
                Arc::clone(&config),
            );
            let sandbox = match image.commit_tag {
                Some(tag) => sandbox.with_commit_tag(tag),
                None => sandbox,
            };
            let name = sandbox.image_name();
            with_spinner(&format!("Building image {}", name), || {
                sandbox.build_image()
            })
            .with_context(|| format!("Failed to build {}", name))?;
            println!("{}", name);
            Ok(())
        }
        Commands::ImageName { image } => {
            println!(
                "{}",
                image_name(&image.os_type, &image.os_version, image.commit_tag.as_deref())
            );
            Ok(())
        }
        Commands::Put {
            sandbox,
            local,
            remote,
            mode,
            owner,
        } => {
            let data = std::fs::read(&local)
                .with_context(|| format!("Failed to read {}", local.display()))?;
            with_sandbox(&sandbox, &config, |sb| {
                sb.sudo_write_file(&remote, data, mode.as_deref(), owner.as_deref())?;
                Ok(())
            })
        }
        Commands::Get {
            sandbox,
            remote,
            dest_dir,
        } => {
            let path = with_sandbox(&sandbox, &config, |sb| Ok(sb.read_file(&remote, &dest_dir)?))?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Tar {
            sandbox,
            remote_dir,
            destination,
            sudo,
        } => with_sandbox(&sandbox, &config, |sb| {
            sb.get_tar(&remote_dir, &destination, sudo)?;
            Ok(())
        }),
        Commands::Probe { sandbox } => {
            let distro = with_sandbox(&sandbox, &config, |sb| Ok(probe::distro(sb)?))?;
            match distro {
                Some(distro) => {
                    let family = probe::SystemType::from_distro(&distro);
                    println!("{} {}", distro, family);
                }
                None => println!("unknown"),
            }
            Ok(())
        }
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "cephbox", &mut io::stdout());
            Ok(())
        }
    }
}
