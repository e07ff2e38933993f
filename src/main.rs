// ============================================================================
// src/main.rs – znx: many versioned, bootable OS images on one device
// ============================================================================

mod cmd;
mod config;
mod descriptor;
mod device;
mod error;
mod session;
mod store;
mod ui;
mod util;

use clap::error::ErrorKind;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use crate::cmd::init::InitOptions;
use crate::config::Config;
use crate::error::Result;
use crate::ui::UX;
use crate::util::interrupt::Interrupt;

const LOG_ENV: &str = "ZNX_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "znx",
    version,
    disable_version_flag = true,
    about = "Carry many versioned, bootable OS images on one removable device.",
    after_help = "Commands against the same device must not run concurrently; \
                  racing invocations are not detected and may corrupt the store."
)]
struct Cli {
    /// Print version information.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    /// Configuration file (TOML, or YAML by extension). Default: /etc/znx.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Do not ask before destroying data.
    #[arg(short = 'y', long = "yes", global = true)]
    yes: bool,

    /// Only print results and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wipe DEVICE and create the boot and data partitions.
    Init { device: PathBuf },
    /// Rewrite the boot loader of an initialized DEVICE.
    #[command(name = "restore-esp")]
    RestoreEsp { device: PathBuf },
    /// Add IMAGE (vendor/release) from a local file or an http(s)/ftp URL.
    Deploy {
        device: PathBuf,
        image: String,
        locator: String,
    },
    /// Delta-update IMAGE, keeping the current version as backup.
    Update { device: PathBuf, image: String },
    /// Make the backup of IMAGE active again.
    Revert { device: PathBuf, image: String },
    /// Delete the backup of IMAGE.
    Clean { device: PathBuf, image: String },
    /// Delete the user data of IMAGE.
    Reset { device: PathBuf, image: String },
    /// Delete IMAGE with its backup and user data.
    Remove { device: PathBuf, image: String },
    /// Show size, age and backup of IMAGE.
    Stats { device: PathBuf, image: String },
    /// List deployed images.
    List { device: PathBuf },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Help and version requests are answers, not usage errors.
fn is_informational(err: &clap::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
    )
}

/// clap's rendering without its own `error:` prefix, which `UX::error` adds.
fn usage_message(err: &clap::Error) -> String {
    let rendered = err.render().to_string();
    rendered
        .strip_prefix("error: ")
        .unwrap_or(&rendered)
        .trim_end()
        .to_string()
}

fn main() -> ExitCode {
    init_logging();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if is_informational(&err) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            UX::new(false).error(&usage_message(&err));
            return ExitCode::FAILURE;
        }
    };
    let ui = UX::new(cli.quiet);

    match run(&ui, cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            ui.error(&err.to_string());
            ExitCode::FAILURE
        }
    }
}

fn run(ui: &UX, cli: Cli) -> Result<()> {
    let cfg = Config::load_or_default(cli.config.as_deref())?;
    if let Some(path) = &cfg.audit.log_path {
        util::audit::init(path.clone());
    }
    let interrupt = Interrupt::install()?;
    interrupt.check()?;
    tracing::debug!(command = ?cli.command, "dispatching");

    match cli.command {
        Commands::Init { device } => cmd::init::run_init(
            ui,
            &cfg,
            &device,
            &InitOptions {
                assume_yes: cli.yes,
            },
            &interrupt,
        ),
        Commands::RestoreEsp { device } => {
            cmd::init::run_restore_esp(ui, &cfg, &device, &interrupt)
        }
        Commands::Deploy {
            device,
            image,
            locator,
        } => cmd::deploy::run_deploy(ui, &cfg, &device, &image, &locator, &interrupt),
        Commands::Update { device, image } => {
            cmd::update::run_update(ui, &cfg, &device, &image, &interrupt)
        }
        Commands::Revert { device, image } => cmd::maintain::run_revert(ui, &cfg, &device, &image),
        Commands::Clean { device, image } => cmd::maintain::run_clean(ui, &cfg, &device, &image),
        Commands::Reset { device, image } => cmd::maintain::run_reset(ui, &cfg, &device, &image),
        Commands::Remove { device, image } => cmd::maintain::run_remove(ui, &cfg, &device, &image),
        Commands::Stats { device, image } => cmd::maintain::run_stats(ui, &cfg, &device, &image),
        Commands::List { device } => cmd::maintain::run_list(ui, &cfg, &device),
    }
}

#[cfg(test)]
mod tests {
    use super::{is_informational, usage_message, Cli, Commands};
    use clap::{CommandFactory, Parser};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn help_and_version_are_not_failures() {
        for args in [
            &["znx", "--help"][..],
            &["znx", "-v"],
            &["znx", "--version"],
            &["znx", "deploy", "--help"],
        ] {
            let err = Cli::try_parse_from(args).unwrap_err();
            assert!(is_informational(&err), "{args:?}");
        }
    }

    #[test]
    fn usage_errors_are_failures_without_a_doubled_prefix() {
        for args in [
            &["znx"][..],
            &["znx", "deploy", "/dev/sdb"],
            &["znx", "frobnicate"],
            &["znx", "list", "/dev/sdb", "--bogus"],
        ] {
            let err = Cli::try_parse_from(args).unwrap_err();
            assert!(!is_informational(&err), "{args:?}");
            let msg = usage_message(&err);
            assert!(!msg.is_empty());
            assert!(!msg.starts_with("error:"), "{msg}");
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["znx", "stats", "/dev/sdb", "acme/os", "-q"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Stats { .. }));
    }
}
