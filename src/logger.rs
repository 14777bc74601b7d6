// (c) Roel Kluin, 2023, GPL v3

use anyhow::{anyhow, Result};
use log::{LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::thread;

struct StderrLogger {
    level: LevelFilter,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let current = thread::current();
        let thread = current.name().unwrap_or("-");
        // a closed stderr is no reason to stop.
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{} {} {}] {}",
            record.level(),
            thread,
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Sends log output to stderr; each `-d` on the command line shows one level more.
pub fn init(verbosity: u8) -> Result<()> {
    let level = level_for(verbosity);
    let logger: &'static StderrLogger = Box::leak(Box::new(StderrLogger { level }));
    log::set_logger(logger).map_err(|e| anyhow!("{e}"))?;
    log::set_max_level(level);
    Ok(())
}
