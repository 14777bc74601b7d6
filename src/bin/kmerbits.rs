// (c) Roel Kluin, 2023, GPL v3

extern crate kmerbits;

// target/release/kmerbits color -t 16 -m 2 sample1.kc sample2.kc.gz sample3.kc -o histogram.tsv
//
// target/release/kmerbits filter -m 5 all.kc all.min5.kc

use anyhow::Result;
use clap::{Parser, Subcommand};
use kmerbits::{filter, loader, logger};

#[derive(Subcommand, Debug)]
enum Commands {
    /// Marks per k-mer which samples hold it and writes a histogram of samples per k-mer
    Color(loader::ColorCmd),

    /// Keeps the k-mer records over a count threshold, in input order
    Filter(filter::FilterCmd),
}

/// Parallel k-mer sample coloring over bit-indexed hash maps
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Kmerbits {
    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn main() -> Result<()> {
    let kmerbits = Kmerbits::parse();
    logger::init(kmerbits.debug)?;

    match kmerbits.command {
        Some(Commands::Color(color_cmd)) => loader::color(color_cmd),
        Some(Commands::Filter(filter_cmd)) => filter::filter(filter_cmd),
        None => Ok(()),
    }
}
