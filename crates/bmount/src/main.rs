#![deny(unsafe_code)]

mod auth;
mod commands;
mod config;
mod exit_code;
mod output;

use std::io;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ColorChoice, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bmount_core::MountError;

use crate::commands::{auto_mount, auto_mount_run, cleanup, mount, status, target, unmount};

/// Mount object-storage buckets as local filesystems through rclone
#[derive(Parser)]
#[command(name = "bmount")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Mount a bucket (prints the mount point)
    bmount mount --user alice photos

    # Show what is mounted
    bmount status --user alice

    # Mount at every login
    bmount auto-mount enable --user alice photos --elevate sudo

    # Detach mounts left behind by a crashed helper
    bmount cleanup --user alice

Helper credentials are taken from BMOUNT_CRED_<NAME> variables and passed
to rclone as <NAME>, e.g. BMOUNT_CRED_RCLONE_CONFIG_PASS.
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// When to use colored output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorChoice,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a bucket
    Mount(mount::Args),

    /// Unmount a bucket, escalating if it is busy
    Unmount(unmount::Args),

    /// Show the state of buckets
    Status(status::Args),

    /// Manage mounting at login
    AutoMount(auto_mount::Args),

    /// Login-task entry point
    #[command(hide = true)]
    AutoMountRun(auto_mount_run::Args),

    /// Detach stale mounts and remove their directories
    Cleanup(cleanup::Args),

    /// Print the target a bucket would be mounted on
    Target(target::Args),
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            let code = categorize_error(&e);

            // Only print error if not quiet mode (quiet is parsed separately for this)
            let args: Vec<String> = std::env::args().collect();
            let is_quiet = args.iter().any(|a| a == "-q" || a == "--quiet");

            if !is_quiet {
                eprintln!("Error: {e:#}");
            }

            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if !cli.quiet {
        setup_tracing(cli.verbose);
    }
    output::set_color(cli.color);

    let settings = config::load()?;
    let quiet = cli.quiet;

    match cli.command {
        Commands::Mount(args) => mount::execute(&args, &settings, quiet),
        Commands::Unmount(args) => unmount::execute(&args, &settings, quiet),
        Commands::Status(args) => status::execute(&args, &settings),
        Commands::AutoMount(args) => auto_mount::execute(&args, &settings, quiet),
        Commands::AutoMountRun(args) => auto_mount_run::execute(&args, &settings),
        Commands::Cleanup(args) => cleanup::execute(&args, &settings, quiet),
        Commands::Target(args) => target::execute(&args, &settings, quiet),
    }
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Categorize an error into an exit code using typed error downcasting
///
/// Library errors carry their own stable code; everything else is mapped
/// by kind.
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(mount_err) = cause.downcast_ref::<MountError>() {
            return mount_err.code();
        }

        if cause.downcast_ref::<toml::de::Error>().is_some() {
            return exit_code::CONFIG_INVALID;
        }

        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::PermissionDenied => return exit_code::PERMISSION_DENIED,
                io::ErrorKind::Interrupted => return exit_code::CANCELLED,
                _ => {}
            }
        }
    }

    exit_code::GENERAL_ERROR
}
