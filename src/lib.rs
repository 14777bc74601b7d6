// (c) Roel Kluin, 2023, GPL v3

#[macro_use]
extern crate derive_new;

pub mod bitmap;
pub mod cancel;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod loader;
pub mod logger;
pub mod ordered;
pub mod pool;
pub mod records;
pub mod sharded;

pub use bitmap::{BitIndexedLongMap, LongWordMap, MapConfig, ShortWordMap, Word};
pub use cancel::{CancelToken, Interrupter};
pub use dispatch::{BytesDispatcher, Dispatch, RecordDispatcher, SeqId, WorkRange};
pub use error::{MapError, PipelineError, RecordError, WorkerFailure};
pub use ordered::OrderedSink;
pub use pool::{PoolConfig, RunSummary, Worker, WorkerPool};
pub use records::{KmerRecord, KmerRecordFormat};
pub use sharded::ShardedBitMap;
