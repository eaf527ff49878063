use chrono::{DateTime, Duration, Utc};
use plantgraph::reader::RecordOrigin;
use plantgraph::*;
use proptest::prelude::*;

fn readings(steps: &[(u8, i64)]) -> Vec<Reading> {
    let mut ts = 0i64;
    steps
        .iter()
        .enumerate()
        .map(|(i, (tag, step))| {
            ts += step;
            Reading {
                tag: format!("T{}", tag % 4),
                timestamp: DateTime::<Utc>::from_timestamp(ts, 0).unwrap(),
                value: Value::Float(i as f64),
                quality: Quality::Good,
                schema_version: "1.1".into(),
                origin: RecordOrigin::new("prop", i),
            }
        })
        .collect()
}

fn chunker(max: usize, max_bytes: Option<usize>, span: Option<i64>) -> Chunker {
    let mut chunker = Chunker::new(max).unwrap();
    if let Some(bytes) = max_bytes {
        chunker = chunker.with_max_bytes(bytes);
    }
    if let Some(secs) = span {
        chunker = chunker.with_max_span(Duration::seconds(secs));
    }
    chunker
}

proptest! {
    #[test]
    fn test_chunks_partition_input_in_order(
        steps in prop::collection::vec((any::<u8>(), 0i64..5), 0..300),
        max in 1usize..50,
        max_bytes in prop::option::of(40usize..2000),
        span in prop::option::of(1i64..30),
    ) {
        let input = readings(&steps);
        let chunker = chunker(max, max_bytes, span);
        let chunks: Vec<Chunk> = chunker.chunks("prop", &input).collect();

        let rebuilt: Vec<Reading> = chunks.iter().flat_map(|c| c.readings.clone()).collect();
        prop_assert_eq!(&rebuilt, &input);

        for (i, chunk) in chunks.iter().enumerate() {
            prop_assert_eq!(chunk.sequence, i as u64);
            prop_assert!(!chunk.is_empty());
            prop_assert!(chunk.len() <= max);
            prop_assert!(chunk.start <= chunk.end);
            if let Some(secs) = span {
                prop_assert!(chunk.len() == 1 || chunk.end - chunk.start <= Duration::seconds(secs));
            }
            if let Some(bytes) = max_bytes {
                let size: usize = chunk.readings.iter().map(|r| r.approx_size()).sum();
                prop_assert!(chunk.len() == 1 || size <= bytes);
            }
        }
    }

    #[test]
    fn test_resume_matches_fresh_pass(
        steps in prop::collection::vec((any::<u8>(), 0i64..5), 0..200),
        max in 1usize..20,
        resume in 0u64..30,
    ) {
        let input = readings(&steps);
        let chunker = chunker(max, None, None);
        let fresh: Vec<Chunk> = chunker.chunks("prop", &input).skip(resume as usize).collect();
        let resumed: Vec<Chunk> = chunker.chunks("prop", &input).resume_at(resume).collect();
        prop_assert_eq!(fresh, resumed);
    }
}
