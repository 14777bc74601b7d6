// (c) Roel Kluin, 2023, GPL v3

use std::fmt;
use thiserror::Error;

/// Misuse of a `BitIndexedLongMap`. These are configuration or programming errors: they are
/// reported immediately and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("key 0 is reserved for empty slots")]
    ReservedKey,

    #[error("bit index {index} out of range for bit length {bit_len}")]
    BitOutOfRange { index: usize, bit_len: usize },

    #[error("no free slot left for key {key:#x} (capacity {capacity}); size the map larger")]
    CapacityExceeded { key: u64, capacity: usize },

    #[error("invalid map configuration: {0}")]
    Config(String),
}

/// A worker that ended with an error instead of running out of work.
#[derive(Debug)]
pub struct WorkerFailure {
    pub worker: usize,
    pub error: anyhow::Error,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {}: {:#}", self.worker, self.error)
    }
}

/// Failure of a whole traversal, reported once by the pool owner.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pool owner's wait for its workers was interrupted.
    /// Failures of workers that stopped on an error before or during the interrupt are kept.
    #[error("interrupted after {finished} of {total} workers finished{}", failed_suffix(.failures))]
    Interrupted {
        finished: usize,
        total: usize,
        failures: Vec<WorkerFailure>,
    },

    /// Cancellation reached a worker still waiting for its turn at the ordered sink.
    #[error("interrupted while range {id} waited for its write turn")]
    TurnInterrupted { id: u64 },

    #[error("{} of {total} workers failed: {}", .failures.len(), join_failures(.failures))]
    WorkersFailed {
        failures: Vec<WorkerFailure>,
        total: usize,
    },

    #[error("unable to spawn worker thread {worker}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
}

fn failed_suffix(failures: &[WorkerFailure]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!(", {} failed: {}", failures.len(), join_failures(failures))
    }
}

fn join_failures(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fixed-width k-mer record decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("range of {len} bytes is not a multiple of the {record} byte record size")]
    Misaligned { len: usize, record: usize },
}
