//! # printd
//!
//! Host process for the printer: reads a G-code stream, plans motion for
//! the CoreXY mechanism, runs the heater control loops, and commands the
//! device transport.
//!
//! Two modes: `run` serves an interactive G-code stream from stdin, and
//! `batch` replays a file in file-input mode (acknowledgements
//! suppressed, EOF shuts everything off) and dumps the schedule the
//! device would have executed.

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use mcu_io::Reactor;
use printd_host::config::PrinterConfig;
use printd_host::gcode::GCodeParser;
use printd_host::printer::build_printer;
use printd_host::reactor::PollReactor;
use sim::SimMcu;

/// Host-side control core for a CoreXY 3D printer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the host server, reading G-code from stdin.
    Run(RunArgs),
    /// Replay a G-code file and print the resulting device schedule.
    Batch(BatchArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the printer configuration file.
    #[arg(short, long, default_value = "printer.cfg")]
    config_path: PathBuf,
}

#[derive(Parser, Debug)]
struct BatchArgs {
    /// Path to the G-code file to process.
    #[arg(required = true)]
    gcode_file: PathBuf,

    /// Path to the printer configuration file.
    #[arg(short, long, default_value = "printer.cfg")]
    config_path: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_server(args),
        Commands::Batch(args) => run_batch(args),
    }
}

fn run_server(args: RunArgs) -> Result<()> {
    info!("Loading configuration from {:?}", args.config_path);
    let config = PrinterConfig::load(&args.config_path)?;
    let reactor: Rc<dyn Reactor> = Rc::new(PollReactor::new());
    let mcu = Arc::new(SimMcu::new(false));
    let parser = build_printer(&config, mcu, reactor.clone(), 0, false)?;
    parser.set_printer_ready(true);
    info!("printer ready");
    main_loop(&parser, &reactor)
}

fn run_batch(args: BatchArgs) -> Result<()> {
    info!("Batch processing {:?}", args.gcode_file);
    let config = PrinterConfig::load(&args.config_path)?;
    let file = std::fs::File::open(&args.gcode_file)
        .with_context(|| format!("failed to open G-code file {:?}", args.gcode_file))?;
    let reactor: Rc<dyn Reactor> = Rc::new(PollReactor::new());
    let sim = Arc::new(SimMcu::new(true));
    let parser = build_printer(&config, sim.clone(), reactor.clone(), file.as_raw_fd(), true)?;
    parser.set_printer_ready(true);
    main_loop(&parser, &reactor)?;

    // Dump the schedule the file produced
    for record in sim.step_log() {
        println!(
            "{:10.3} {:16} {:?}: {:+.0} steps",
            record.mcu_time, record.stepper, record.kind, record.count
        );
    }
    for record in sim.pwm_log() {
        println!(
            "{:10.3} {:16} pwm: {:.3}",
            record.mcu_time, record.pin, record.value
        );
    }
    info!("Batch processing finished");
    Ok(())
}

/// Drive the reactor until something requests an exit.
fn main_loop(parser: &Rc<GCodeParser>, reactor: &Rc<dyn Reactor>) -> Result<()> {
    loop {
        if let Some(reason) = parser.printer().exit_requested() {
            info!(%reason, stats = %parser.stats(), "host exiting");
            return Ok(());
        }
        let now = reactor.monotonic();
        reactor.pause(now + 0.250);
    }
}
