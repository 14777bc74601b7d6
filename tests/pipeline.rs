#[cfg(test)]
mod tests {
    use kmerbits::filter::filter_ordered;
    use kmerbits::loader::{color_samples, sample_histogram};
    use kmerbits::{
        BytesDispatcher, KmerRecord, KmerRecordFormat, MapConfig, OrderedSink, PoolConfig,
        SeqId, ShardedBitMap,
    };
    use kmerbits::{RecordDispatcher, WorkerPool};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Write;
    use std::thread;
    use std::time::Duration;

    const MIB: usize = 1 << 20;

    #[test]
    fn ten_ranges_in_order() {
        let data: Vec<u8> = (0..10 * MIB).map(|i| (i / MIB) as u8).collect();
        let dispatcher = BytesDispatcher::new(&data[..], MIB);
        let sink = OrderedSink::new(Vec::new());
        let pool = WorkerPool::new("ten", PoolConfig::default().threads(4));
        let summary = pool
            .run_ordered(
                &dispatcher,
                &sink,
                |_| {
                    |range: Vec<u8>| -> anyhow::Result<(u8, usize)> {
                        assert!(range.iter().all(|&b| b == range[0]));
                        Ok((range[0], range.len()))
                    }
                },
                |calls: &mut Vec<(u8, usize)>, call| {
                    calls.push(call);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(summary.ranges, 10);
        let calls = sink.into_inner();
        assert_eq!(calls, (0..10).map(|i| (i, MIB)).collect::<Vec<_>>());
    }

    fn run_with_delays(max_delay_us: u64) -> Vec<u64> {
        let dispatcher = RecordDispatcher::from_records(0..2_000_u64, 7);
        let sink = OrderedSink::new(Vec::new());
        let pool = WorkerPool::new("delays", PoolConfig::default().threads(6));
        pool.run_ordered(
            &dispatcher,
            &sink,
            |i| {
                let mut rng = StdRng::seed_from_u64(i as u64);
                move |range: Vec<u64>| -> anyhow::Result<Vec<u64>> {
                    if max_delay_us > 0 {
                        thread::sleep(Duration::from_micros(rng.gen_range(0..max_delay_us)));
                    }
                    Ok(range.iter().map(|x| x * x).collect::<Vec<_>>())
                }
            },
            |out: &mut Vec<u64>, squares: Vec<u64>| {
                out.extend(squares);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(sink.next_turn(), SeqId(286));
        sink.into_inner()
    }

    #[test]
    fn order_does_not_depend_on_timing() {
        let plain = run_with_delays(0);
        assert_eq!(plain, (0..2_000_u64).map(|x| x * x).collect::<Vec<_>>());
        assert_eq!(run_with_delays(300), plain);
    }

    fn write_sample(records: &[KmerRecord]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for &r in records {
            KmerRecordFormat::Long.encode(&mut file, r).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn filter_then_color() {
        let mut rng = StdRng::seed_from_u64(2023);
        let samples: Vec<Vec<KmerRecord>> = (0..5)
            .map(|_| {
                (0..3_000)
                    .map(|_| KmerRecord::new(rng.gen_range(1..5_000), rng.gen_range(0..20)))
                    .collect()
            })
            .collect();
        let config = PoolConfig::default().threads(4).range_bytes(4_000);

        // filtering first and coloring with threshold 0 equals coloring with the threshold
        let mut filtered = Vec::new();
        for records in &samples {
            let file = write_sample(records);
            let input = std::fs::File::open(file.path()).unwrap();
            let out = tempfile::NamedTempFile::new().unwrap();
            let (out, stats) =
                filter_ordered(input, out, KmerRecordFormat::Long, 9, &config).unwrap();
            assert_eq!(stats.records, 3_000);
            filtered.push(out);
        }
        let unfiltered: Vec<_> = samples.iter().map(|r| write_sample(r)).collect();

        let paths = |files: &[tempfile::NamedTempFile]| -> Vec<_> {
            files.iter().map(|f| f.path().to_path_buf()).collect()
        };
        let direct: ShardedBitMap = ShardedBitMap::new(3, MapConfig::with_expected(5_000, 5)).unwrap();
        color_samples(&paths(&unfiltered[..]), &direct, KmerRecordFormat::Long, 9, &config).unwrap();
        let staged: ShardedBitMap = ShardedBitMap::new(3, MapConfig::with_expected(5_000, 5)).unwrap();
        color_samples(&paths(&filtered[..]), &staged, KmerRecordFormat::Long, 0, &config).unwrap();

        // the filtered files only hold counts over 9, which all pass a threshold of 0
        assert_eq!(direct.len(), staged.len());
        direct.for_each(|key, value| assert_eq!(staged.get(key).as_deref(), Some(value)));
        assert_eq!(sample_histogram(&direct), sample_histogram(&staged));

        for (i, records) in samples.iter().enumerate() {
            for r in records {
                if r.count > 9 {
                    assert!(direct.get_bit(r.kmer, i));
                }
            }
        }
    }
}
