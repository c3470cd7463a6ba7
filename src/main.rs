use clap::{Parser, Subcommand};
use std::process;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

mod cmd;
mod reports;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(global = true, long, default_value_t = false)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Orbit correction with steering magnets
    Steer(cmd::steer::SteerArgs),
    /// RF phase optimization of a traveling-wave section
    Phase(cmd::phase::PhaseArgs),
    /// Monte-Carlo error analysis
    Errors(cmd::errors::ErrorsArgs),
    /// Linear scan of a single lattice field
    Scan(cmd::scan::ScanArgs),
    /// Nested scan driven by !@var / !@subs directives in the lattice
    Sweep(cmd::sweep::SweepArgs),
}

fn main() {
    // Usage errors exit with 1 like every other failure; --help and --version with 0.
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        process::exit(if e.use_stderr() { 1 } else { 0 });
    });

    let level = if cli.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    println!("\n🚀 Initializing BeamForge...");

    let result = match cli.command {
        Commands::Steer(args) => cmd::steer::run(args),
        Commands::Phase(args) => cmd::phase::run(args),
        Commands::Errors(args) => cmd::errors::run(args),
        Commands::Scan(args) => cmd::scan::run(args),
        Commands::Sweep(args) => cmd::sweep::run(args),
    };

    if let Err(e) = result {
        error!("❌ FATAL: {}", e);
        process::exit(1);
    }
}
