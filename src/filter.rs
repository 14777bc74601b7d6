// (c) Roel Kluin, 2023, GPL v3

use crate::dispatch::BytesDispatcher;
use crate::loader::open_input;
use crate::ordered::OrderedSink;
use crate::pool::{PoolConfig, WorkerPool};
use crate::records::KmerRecordFormat;
use anyhow::{ensure, Context, Result};
use clap::Args;
use log::info;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Args, Debug)]
pub struct FilterCmd {
    /// Binary k-mer count file, optionally gzipped
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// The output file
    #[arg(value_name = "OUT")]
    output: PathBuf,

    /// Record layout of input and output
    #[arg(short, long, value_enum, default_value_t = KmerRecordFormat::Short)]
    format: KmerRecordFormat,

    /// Keep the k-mers counted more often than this
    #[arg(short = 'm', long, default_value = "1")]
    threshold: i64,

    #[command(flatten)]
    pool: PoolConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub records: u64,
    pub kept: u64,
    pub ranges: u64,
}

/// Copies the records of `source` with a count over `threshold` to `sink`, in the order they
/// were read. Ranges are filtered in parallel and written in turn.
pub fn filter_ordered<R, W>(
    source: R,
    sink: W,
    format: KmerRecordFormat,
    threshold: i64,
    config: &PoolConfig,
) -> Result<(W, FilterStats)>
where
    R: Read + Send,
    W: Write + Send,
{
    let dispatcher = BytesDispatcher::aligned(source, config.range_bytes, format.record_size());
    let sink = OrderedSink::new(sink);
    let records = AtomicU64::new(0);
    let kept = AtomicU64::new(0);
    let pool = WorkerPool::new("filter", config.clone());

    let (records_ref, kept_ref) = (&records, &kept);
    let summary = pool
        .run_ordered(
            &dispatcher,
            &sink,
            |_| {
                move |range: Vec<u8>| -> Result<Vec<u8>> {
                    let mut out = Vec::with_capacity(range.len());
                    let mut n = 0;
                    for record in format.decode(&range)? {
                        n += 1;
                        if record.count > threshold {
                            format.encode(&mut out, record)?;
                        }
                    }
                    records_ref.fetch_add(n, Ordering::Relaxed);
                    kept_ref.fetch_add((out.len() / format.record_size()) as u64, Ordering::Relaxed);
                    Ok(out)
                }
            },
            |w: &mut W, out: Vec<u8>| Ok(w.write_all(&out)?),
        )
        .context("filtering records")?;
    ensure!(!summary.cancelled, "filtering was cancelled");

    let mut sink = sink.into_inner();
    sink.flush()?;
    let stats = FilterStats {
        records: records.into_inner(),
        kept: kept.into_inner(),
        ranges: summary.ranges,
    };
    info!(
        "kept {} of {} records over {} in {} ranges",
        stats.kept, stats.records, threshold, stats.ranges
    );
    Ok((sink, stats))
}

pub fn filter(cmd: FilterCmd) -> Result<()> {
    ensure!(!cmd.output.exists(), "{:?} already exists!", cmd.output);
    eprintln!("Reading {:?}", cmd.input);
    let input = open_input(&cmd.input)?;
    let output = BufWriter::new(File::create(&cmd.output)?);
    let (_, stats) = filter_ordered(input, output, cmd.format, cmd.threshold, &cmd.pool)?;
    eprintln!(
        "Wrote {} of {} records to {:?}",
        stats.kept, stats.records, cmd.output
    );
    Ok(())
}
