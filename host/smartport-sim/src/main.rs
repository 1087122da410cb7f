pub mod args;
pub mod ramdisk;
pub mod scenario;

use crate::args::Args;
use crate::scenario::Options;
use clap::Parser;
use color_eyre::eyre;
use smartport_bus::sim::SimBus;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    stderrlog::new()
        .module(module_path!())
        .module("smartport_bus")
        .quiet(args.quiet)
        .verbosity(args.verbose as usize)
        .init()?;

    let options = Options {
        devices: args.devices,
        blocks: args.blocks,
        operations: args.operations,
        seed: args.seed.unwrap_or_else(rand::random),
        first_unit: args.first_unit,
    };
    let report = scenario::run(&options)?;

    if !args.quiet {
        println!(
            "seed {}: {} devices numbered, {} blocks read, {} written in {}us of bus time",
            options.seed,
            report.inits,
            report.reads,
            report.writes,
            report.ticks / SimBus::TICKS_PER_US as u64
        );
    }
    Ok(())
}
