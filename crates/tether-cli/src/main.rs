//! Tether command-line tool
//!
//! Editor-time operations on compiled images: hot-patch injection,
//! verification, and listing patchable signatures.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether_engine::BridgeOptions;

mod commands;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Hot-patch injector for Tether images", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to tether.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inject patch prologues into every patchable method
    Inject {
        /// Input image
        input: PathBuf,
        /// Output image (defaults to rewriting the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify an image and every method body in it
    Verify {
        /// Input image
        input: PathBuf,
    },

    /// List method signatures of an image
    Signatures {
        /// Input image
        input: PathBuf,
        /// Only patchable methods
        #[arg(short, long)]
        patchable: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = match &cli.config {
        Some(path) => BridgeOptions::load(path)?,
        None => BridgeOptions::default(),
    };
    log::debug!("options: {:?}", options);

    match cli.command {
        Commands::Inject { input, output, json } => commands::inject::execute(&input, output.as_deref(), json),
        Commands::Verify { input } => commands::verify::execute(&input, &options),
        Commands::Signatures { input, patchable } => commands::signatures::execute(&input, patchable),
    }
}
