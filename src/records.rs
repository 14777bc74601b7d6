// (c) Roel Kluin, 2023, GPL v3

use crate::error::RecordError;
use clap::ValueEnum;
use std::io::{self, Write};

/// Layout of the fixed width, big endian k-mer count records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KmerRecordFormat {
    /// 8 byte k-mer, 2 byte signed count
    Short,
    /// 8 byte k-mer, 8 byte signed count
    Long,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, new)]
pub struct KmerRecord {
    pub kmer: u64,
    pub count: i64,
}

impl KmerRecordFormat {
    pub const fn record_size(self) -> usize {
        match self {
            KmerRecordFormat::Short => 10,
            KmerRecordFormat::Long => 16,
        }
    }

    /// The records of a whole range; a trailing partial record is an error.
    pub fn decode(self, range: &[u8]) -> Result<impl Iterator<Item = KmerRecord> + '_, RecordError> {
        let record = self.record_size();
        if range.len() % record != 0 {
            return Err(RecordError::Misaligned {
                len: range.len(),
                record,
            });
        }
        Ok(range.chunks_exact(record).map(move |r| {
            let (kmer, count) = r.split_at(8);
            let kmer = u64::from_be_bytes(kmer.try_into().unwrap_or_default());
            let count = match self {
                KmerRecordFormat::Short => i16::from_be_bytes([count[0], count[1]]) as i64,
                KmerRecordFormat::Long => i64::from_be_bytes(count.try_into().unwrap_or_default()),
            };
            KmerRecord { kmer, count }
        }))
    }

    /// Writes one record. A count outside the `Short` range is saturated.
    pub fn encode<W: Write>(self, out: &mut W, record: KmerRecord) -> io::Result<()> {
        out.write_all(&record.kmer.to_be_bytes())?;
        match self {
            KmerRecordFormat::Short => {
                let count = record.count.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
                out.write_all(&count.to_be_bytes())
            }
            KmerRecordFormat::Long => out.write_all(&record.count.to_be_bytes()),
        }
    }
}
