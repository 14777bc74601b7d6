// (c) Roel Kluin, 2023, GPL v3

use crate::bitmap::{MapConfig, Word, DEFAULT_LOAD_FACTOR};
use crate::dispatch::{BytesDispatcher, WorkRange};
use crate::pool::{PoolConfig, WorkerPool};
use crate::records::KmerRecordFormat;
use crate::sharded::ShardedBitMap;
use ahash::AHashMap;
use anyhow::{ensure, Context, Result};
use bitvec::prelude::{BitSlice, Lsb0};
use clap::Args;
use flate2::read::MultiGzDecoder;
use itertools::Itertools;
use log::{info, warn};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Args, Debug)]
pub struct ColorCmd {
    /// Binary k-mer count files, one per sample, optionally gzipped
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// Record layout of the input files
    #[arg(short, long, value_enum, default_value_t = KmerRecordFormat::Short)]
    format: KmerRecordFormat,

    /// A k-mer counts for a sample if counted more often than this
    #[arg(short = 'm', long, default_value = "1")]
    threshold: i64,

    /// Expected number of distinct k-mers over all samples
    #[arg(short = 'n', long, default_value = "100000000")]
    expected: usize,

    /// Load factor of the k-mer table
    #[arg(long, default_value_t = DEFAULT_LOAD_FACTOR)]
    load_factor: f32,

    /// Store the sample bits in 64 bit words instead of 16 bit words
    #[arg(long)]
    long_words: bool,

    /// Output for the histogram of samples per k-mer (TSV), stdout if absent
    #[arg(short, long, value_name = "TSV")]
    out: Option<PathBuf>,

    #[command(flatten)]
    pool: PoolConfig,
}

/// Opens `path` for reading, decompressing it if the name ends in `.gz`.
pub fn open_input(path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path).with_context(|| format!("opening {path:?}"))?;
    if path.extension().map_or(false, |ext| ext == "gz") {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleStats {
    pub path: PathBuf,
    pub sample: usize,
    pub records: u64,
    /// Records with a count over the threshold, set in the map.
    pub kept: u64,
    /// Records for k-mer 0, which the map cannot hold.
    pub zero_keys: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct Counters {
    records: AtomicU64,
    kept: AtomicU64,
    zero_keys: AtomicU64,
}

/// Marks in `map` which samples hold each k-mer: bit `i` of a k-mer is set when file `i` lists
/// it with a count over `threshold`. Files are read one after the other, each by a pool of
/// `config.threads` workers.
pub fn color_samples<W: Word>(
    files: &[PathBuf],
    map: &ShardedBitMap<W>,
    format: KmerRecordFormat,
    threshold: i64,
    config: &PoolConfig,
) -> Result<Vec<SampleStats>> {
    ensure!(
        files.len() <= map.bit_len().max(1),
        "{} samples do not fit in bit vectors of {} bits",
        files.len(),
        map.bit_len()
    );
    let mut stats = Vec::with_capacity(files.len());
    for (sample, path) in files.iter().enumerate() {
        let input = open_input(path)?;
        let dispatcher = BytesDispatcher::aligned(input, config.range_bytes, format.record_size());
        let counters = Counters::default();
        let pool = WorkerPool::new(format!("color-{sample}"), config.clone());

        let counts = &counters;
        let summary = pool
            .run(&dispatcher, |_| {
                move |range: WorkRange<Vec<u8>>| -> Result<()> {
                    let (mut records, mut kept, mut zero_keys) = (0, 0, 0);
                    for record in format
                        .decode(&range.data)
                        .with_context(|| format!("range {}", range.id))?
                    {
                        records += 1;
                        if record.kmer == 0 {
                            zero_keys += 1;
                        } else if record.count > threshold {
                            map.insert_bit(record.kmer, sample)?;
                            kept += 1;
                        }
                    }
                    counts.records.fetch_add(records, Ordering::Relaxed);
                    counts.kept.fetch_add(kept, Ordering::Relaxed);
                    counts.zero_keys.fetch_add(zero_keys, Ordering::Relaxed);
                    Ok(())
                }
            })
            .with_context(|| format!("loading {path:?}"))?;
        ensure!(!summary.cancelled, "loading {path:?} was cancelled");

        let sample_stats = SampleStats {
            path: path.clone(),
            sample,
            records: counters.records.into_inner(),
            kept: counters.kept.into_inner(),
            zero_keys: counters.zero_keys.into_inner(),
            bytes: dispatcher.bytes_read(),
        };
        info!(
            "{:?}: {} of {} k-mers over {}, {} keys in map",
            path,
            sample_stats.kept,
            sample_stats.records,
            threshold,
            map.len()
        );
        if sample_stats.zero_keys > 0 {
            warn!("{:?}: skipped {} records of k-mer 0", path, sample_stats.zero_keys);
        }
        stats.push(sample_stats);
    }
    Ok(stats)
}

/// For each number of samples, how many k-mers were found in exactly that many samples.
pub fn sample_histogram<W: Word>(map: &ShardedBitMap<W>) -> Vec<(usize, u64)> {
    let mut histogram: AHashMap<usize, u64> = AHashMap::new();
    map.for_each(|_, value| {
        *histogram
            .entry(BitSlice::<W, Lsb0>::from_slice(value).count_ones())
            .or_default() += 1;
    });
    histogram.into_iter().sorted().collect()
}

pub fn color(cmd: ColorCmd) -> Result<()> {
    let config = MapConfig::new(cmd.expected, cmd.load_factor, cmd.files.len());
    if cmd.long_words {
        color_with::<u64>(&cmd, config)
    } else {
        color_with::<u16>(&cmd, config)
    }
}

fn color_with<W: Word>(cmd: &ColorCmd, config: MapConfig) -> Result<()> {
    let map: ShardedBitMap<W> = ShardedBitMap::for_threads(cmd.pool.threads, config)?;
    eprintln!(
        "Coloring {} samples with {} threads in {} shards",
        cmd.files.len(),
        cmd.pool.threads,
        map.shard_count()
    );
    let stats = color_samples(&cmd.files, &map, cmd.format, cmd.threshold, &cmd.pool)?;
    let kept: u64 = stats.iter().map(|s| s.kept).sum();
    eprintln!("{} distinct k-mers from {} sample k-mers", map.len(), kept);

    let out: Box<dyn Write> = match &cmd.out {
        Some(path) => {
            ensure!(!path.exists(), "{path:?} already exists!");
            Box::new(BufWriter::new(File::create(path)?))
        }
        None => Box::new(io::stdout().lock()),
    };
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
    wtr.write_record(["samples", "kmers"])?;
    for (samples, kmers) in sample_histogram(&map) {
        wtr.write_record(&[samples.to_string(), kmers.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}
