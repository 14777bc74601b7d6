// (c) Roel Kluin, 2023, GPL v3

use anyhow::{Context, Result};
use derive_more::{Display, From, Into};
use log::debug;
use std::convert::Infallible;
use std::io::{self, ErrorKind, Read};
use std::sync::{Mutex, PoisonError};

// progress is logged each time this many bytes or records have been handed out.
const BYTES_PER_REPORT: u64 = 1 << 29;
const RECORDS_PER_REPORT: u64 = 2_500_000;

/// Position of a range in its source, counted from 0 without gaps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
pub struct SeqId(pub u64);

/// A bounded piece of the source, owned by the worker that fetched it.
#[derive(Debug, new)]
pub struct WorkRange<R> {
    pub id: SeqId,
    pub data: R,
}

/// One sequential source shared by the workers of a pool. Only the fetch is serialized,
/// processing of the returned range happens outside of any lock.
pub trait Dispatch: Sync {
    type Range: Send;

    /// The next range, `None` once the source is exhausted. After an error the source counts
    /// as exhausted for the other workers.
    fn next_range(&self) -> Result<Option<WorkRange<Self::Range>>>;

    /// Ranges handed out so far.
    fn dispatched(&self) -> u64;
}

struct ByteState<R> {
    reader: R,
    bytes_read: u64,
    dispatched: u64,
    next_report: u64,
    exhausted: bool,
}

/// Cuts a byte stream into ranges of `range_size` bytes. Only the last range can be shorter.
pub struct BytesDispatcher<R> {
    state: Mutex<ByteState<R>>,
    range_size: usize,
}

impl<R: Read + Send> BytesDispatcher<R> {
    pub fn new(reader: R, range_size: usize) -> Self {
        BytesDispatcher {
            state: Mutex::new(ByteState {
                reader,
                bytes_read: 0,
                dispatched: 0,
                next_report: BYTES_PER_REPORT,
                exhausted: false,
            }),
            range_size: range_size.max(1),
        }
    }

    /// Range size rounded down to a multiple of `align`, at least one `align`.
    pub fn aligned(reader: R, range_size: usize, align: usize) -> Self {
        let align = align.max(1);
        Self::new(reader, (range_size / align).max(1) * align)
    }

    pub fn range_size(&self) -> usize {
        self.range_size
    }

    pub fn bytes_read(&self) -> u64 {
        self.lock().bytes_read
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ByteState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills `buf` from the source, retrying short and interrupted reads. Fewer bytes than
    /// `buf.len()` means the source ended, 0 that there was nothing left.
    pub fn read_range(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_tagged(buf)?.map_or(0, |(_, n)| n))
    }

    /// As `read_range`, with the sequence id assigned to a non-empty range.
    pub fn read_tagged(&self, buf: &mut [u8]) -> io::Result<Option<(SeqId, usize)>> {
        let mut state = self.lock();
        if state.exhausted || buf.is_empty() {
            return Ok(None);
        }
        let mut filled = 0;
        while filled < buf.len() {
            match state.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    state.exhausted = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    state.exhausted = true;
                    return Err(e);
                }
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        state.bytes_read += filled as u64;
        let id = SeqId(state.dispatched);
        state.dispatched += 1;
        if state.bytes_read >= state.next_report {
            state.next_report += BYTES_PER_REPORT;
            debug!("{} MiB dispatched in {} ranges", state.bytes_read >> 20, state.dispatched);
        }
        Ok(Some((id, filled)))
    }
}

impl<R: Read + Send> Dispatch for BytesDispatcher<R> {
    type Range = Vec<u8>;

    fn next_range(&self) -> Result<Option<WorkRange<Vec<u8>>>> {
        let mut buf = vec![0; self.range_size];
        let tagged = self
            .read_tagged(&mut buf)
            .with_context(|| format!("reading range of {} bytes", self.range_size))?;
        Ok(tagged.map(|(id, n)| {
            buf.truncate(n);
            WorkRange::new(id, buf)
        }))
    }

    fn dispatched(&self) -> u64 {
        self.lock().dispatched
    }
}

struct RecordState<I> {
    records: I,
    taken: u64,
    dispatched: u64,
    next_report: u64,
    exhausted: bool,
}

/// Hands out batches of up to `batch` records from a shared iterator.
pub struct RecordDispatcher<I> {
    state: Mutex<RecordState<I>>,
    batch: usize,
}

impl<I, T, E> RecordDispatcher<I>
where
    I: Iterator<Item = Result<T, E>> + Send,
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(records: I, batch: usize) -> Self {
        RecordDispatcher {
            state: Mutex::new(RecordState {
                records,
                taken: 0,
                dispatched: 0,
                next_report: RECORDS_PER_REPORT,
                exhausted: false,
            }),
            batch: batch.max(1),
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn records_taken(&self) -> u64 {
        self.lock().taken
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordState<I>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Up to `max` records, never an empty list: `None` once the iterator ran out. A decode
    /// error drops the partial batch and ends the source.
    pub fn next_records(&self, max: usize) -> Result<Option<WorkRange<Vec<T>>>, E> {
        let mut state = self.lock();
        if state.exhausted || max == 0 {
            return Ok(None);
        }
        let mut list = Vec::with_capacity(max.min(self.batch));
        while list.len() < max {
            match state.records.next() {
                Some(Ok(record)) => list.push(record),
                Some(Err(e)) => {
                    state.exhausted = true;
                    return Err(e);
                }
                None => {
                    state.exhausted = true;
                    break;
                }
            }
        }
        if list.is_empty() {
            return Ok(None);
        }
        state.taken += list.len() as u64;
        let id = SeqId(state.dispatched);
        state.dispatched += 1;
        if state.taken >= state.next_report {
            state.next_report += RECORDS_PER_REPORT;
            debug!("{} records dispatched in {} ranges", state.taken, state.dispatched);
        }
        Ok(Some(WorkRange::new(id, list)))
    }
}

impl<T: Send> RecordDispatcher<std::vec::IntoIter<Result<T, Infallible>>> {
    /// Dispatcher over records that cannot fail to decode.
    pub fn from_records<J>(records: J, batch: usize) -> Self
    where
        J: IntoIterator<Item = T>,
    {
        let records: Vec<Result<T, Infallible>> = records.into_iter().map(Ok).collect();
        RecordDispatcher::new(records.into_iter(), batch)
    }
}

impl<I, T, E> Dispatch for RecordDispatcher<I>
where
    I: Iterator<Item = Result<T, E>> + Send,
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    type Range = Vec<T>;

    fn next_range(&self) -> Result<Option<WorkRange<Vec<T>>>> {
        self.next_records(self.batch).context("decoding record")
    }

    fn dispatched(&self) -> u64 {
        self.lock().dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    /// Returns at most a few bytes per call and is interrupted now and then.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        rng: StdRng,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rng.gen_ratio(1, 5) {
                return Err(io::Error::new(ErrorKind::Interrupted, "again"));
            }
            let n = buf.len().min(self.rng.gen_range(1..8));
            self.data.read(&mut buf[..n])
        }
    }

    struct Broken(usize);

    impl Read for Broken {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0 == 0 {
                return Err(io::Error::new(ErrorKind::Other, "disk on fire"));
            }
            let n = buf.len().min(self.0);
            buf[..n].fill(b'A');
            self.0 -= n;
            Ok(n)
        }
    }

    #[test]
    fn ranges_reconstruct_source() {
        let mut rng = StdRng::seed_from_u64(11);
        let data: Vec<u8> = (0..10_007).map(|_| rng.gen()).collect();
        let source = Trickle {
            data: Cursor::new(data.clone()),
            rng: StdRng::seed_from_u64(12),
        };
        let dispatcher = BytesDispatcher::new(source, 1000);
        let mut joined = Vec::new();
        let mut expect_id = 0;
        while let Some(range) = dispatcher.next_range().unwrap() {
            assert_eq!(range.id, SeqId(expect_id));
            expect_id += 1;
            if range.data.len() != 1000 {
                assert_eq!(joined.len() + range.data.len(), data.len());
            }
            joined.extend_from_slice(&range.data);
        }
        assert_eq!(joined, data);
        assert_eq!(dispatcher.dispatched(), 11);
        assert_eq!(dispatcher.bytes_read(), 10_007);
        assert!(dispatcher.next_range().unwrap().is_none());
    }

    #[test]
    fn empty_source() {
        let dispatcher = BytesDispatcher::new(io::empty(), 16);
        assert!(dispatcher.next_range().unwrap().is_none());
        assert_eq!(dispatcher.read_range(&mut [0; 4]).unwrap(), 0);
        assert_eq!(dispatcher.dispatched(), 0);
    }

    #[test]
    fn error_ends_source() {
        let dispatcher = BytesDispatcher::new(Broken(10), 4);
        let mut buf = [0; 4];
        assert_eq!(dispatcher.read_range(&mut buf).unwrap(), 4);
        assert_eq!(dispatcher.read_range(&mut buf).unwrap(), 4);
        assert!(dispatcher.read_range(&mut buf).is_err());
        assert_eq!(dispatcher.read_range(&mut buf).unwrap(), 0);
        assert_eq!(dispatcher.bytes_read(), 8);
    }

    #[test]
    fn aligned_range_size() {
        assert_eq!(BytesDispatcher::aligned(io::empty(), 1 << 20, 10).range_size(), 1_048_570);
        assert_eq!(BytesDispatcher::aligned(io::empty(), 7, 10).range_size(), 10);
    }

    #[test]
    fn record_batches() {
        let dispatcher = RecordDispatcher::from_records(0..25, 10);
        let mut lens = Vec::new();
        let mut all = Vec::new();
        while let Some(range) = dispatcher.next_range().unwrap() {
            assert_eq!(range.id, SeqId(lens.len() as u64));
            lens.push(range.data.len());
            all.extend(range.data);
        }
        assert_eq!(lens, vec![10, 10, 5]);
        assert_eq!(all, (0..25).collect::<Vec<_>>());
        assert_eq!(dispatcher.records_taken(), 25);
        assert_eq!(dispatcher.next_records(3).unwrap().map(|r| r.data), None);
    }

    #[test]
    fn record_error_ends_source() {
        let records = vec![
            Ok(1),
            Ok(2),
            Err(io::Error::new(ErrorKind::InvalidData, "bad record")),
            Ok(4),
        ];
        let dispatcher = RecordDispatcher::new(records.into_iter(), 2);
        assert_eq!(dispatcher.next_records(2).unwrap().map(|r| r.data), Some(vec![1, 2]));
        assert!(dispatcher.next_range().is_err());
        assert!(dispatcher.next_range().unwrap().is_none());
        assert_eq!(dispatcher.dispatched(), 1);
    }
}
