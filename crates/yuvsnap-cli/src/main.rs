// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

mod capture;
mod error;
mod info;
mod utils;
mod watch;

use clap::{Parser, Subcommand};
use error::result_to_exit_code;
use std::process::ExitCode;

/// yuvsnap - Still image capture from V4L2 cameras
#[derive(Parser)]
#[command(name = "yuvsnap")]
#[command(version)]
#[command(about = "yuvsnap - Still image capture from V4L2 cameras")]
#[command(long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (use RUST_LOG=trace for more)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print results in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a single frame to a JPEG file
    Capture(capture::Args),

    /// Capture continuously, replacing a JPEG file on a fixed interval
    Watch(watch::Args),

    /// Display camera identity, capabilities and negotiated format
    Info(info::Args),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Capture(args) => capture::execute(args, cli.json),
        Commands::Watch(args) => watch::execute(args, cli.json),
        Commands::Info(args) => info::execute(args, cli.json),
    };

    result_to_exit_code(result)
}

/// Initialize env_logger based on verbosity flags
fn init_logging(verbose: bool, quiet: bool) {
    let env = env_logger::Env::default();

    let env = if quiet {
        env.default_filter_or("error")
    } else if verbose {
        env.default_filter_or("debug")
    } else {
        env.default_filter_or("info")
    };

    env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_target(false)
        .init();

    log::debug!("Logging initialized");
}
