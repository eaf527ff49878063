//! Bounded, sequence-numbered windows over an ordered reading stream.

use crate::config::PipelineSettings;
use crate::error::{PipelineError, Result};
use crate::normalizer::Reading;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A self-describing window of consecutive readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub sequence: u64,
    pub source_id: String,
    pub chunk_id: String,
    /// Earliest timestamp in the chunk
    pub start: DateTime<Utc>,
    /// Latest timestamp in the chunk
    pub end: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Chunk limits. A single reading always forms a chunk on its own even when
/// it exceeds the byte limit.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_readings: usize,
    max_bytes: Option<usize>,
    max_span: Option<Duration>,
}

impl Chunker {
    pub fn new(max_readings: usize) -> Result<Self> {
        if max_readings == 0 {
            return Err(PipelineError::Config("max_chunk_readings must be > 0".into()));
        }
        Ok(Self { max_readings, max_bytes: None, max_span: None })
    }

    pub fn from_settings(settings: &PipelineSettings) -> Result<Self> {
        let mut chunker = Self::new(settings.max_chunk_readings)?;
        chunker.max_bytes = settings.max_chunk_bytes;
        chunker.max_span = settings.max_chunk_span_ms.map(|ms| Duration::milliseconds(ms as i64));
        Ok(chunker)
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn with_max_span(mut self, span: Duration) -> Self {
        self.max_span = Some(span);
        self
    }

    /// Lazily split `readings` into chunks, numbered from zero.
    pub fn chunks<'a>(&'a self, source_id: &str, readings: &'a [Reading]) -> Chunks<'a> {
        Chunks {
            chunker: self,
            source_id: source_id.to_string(),
            readings,
            pos: 0,
            next_sequence: 0,
        }
    }

    /// Exclusive end index of the chunk starting at `start`
    fn boundary(&self, readings: &[Reading], start: usize) -> usize {
        let mut end = start;
        let mut bytes = 0usize;
        let mut lo: Option<DateTime<Utc>> = None;
        let mut hi: Option<DateTime<Utc>> = None;

        while end < readings.len() && end - start < self.max_readings {
            let reading = &readings[end];
            let size = reading.approx_size();
            let taken = end > start;

            if let Some(max) = self.max_bytes {
                if taken && bytes + size > max {
                    break;
                }
            }
            let new_lo = lo.map_or(reading.timestamp, |lo| lo.min(reading.timestamp));
            let new_hi = hi.map_or(reading.timestamp, |hi| hi.max(reading.timestamp));
            if let Some(span) = self.max_span {
                if taken && new_hi - new_lo > span {
                    break;
                }
            }

            bytes += size;
            lo = Some(new_lo);
            hi = Some(new_hi);
            end += 1;
        }
        end
    }
}

/// Lazy chunk iterator
pub struct Chunks<'a> {
    chunker: &'a Chunker,
    source_id: String,
    readings: &'a [Reading],
    pos: usize,
    next_sequence: u64,
}

impl<'a> Chunks<'a> {
    /// Skip forward so the next chunk has sequence `sequence`. Chunk
    /// boundaries are identical to the ones a fresh pass produces.
    pub fn resume_at(mut self, sequence: u64) -> Self {
        while self.next_sequence < sequence && self.pos < self.readings.len() {
            self.pos = self.chunker.boundary(self.readings, self.pos);
            self.next_sequence += 1;
        }
        trace!("Chunk stream {} resumed at sequence {}", self.source_id, self.next_sequence);
        self
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.pos >= self.readings.len() {
            return None;
        }
        let end = self.chunker.boundary(self.readings, self.pos);
        let slice = &self.readings[self.pos..end];
        self.pos = end;

        let start = slice.iter().map(|r| r.timestamp).min()?;
        let last = slice.iter().map(|r| r.timestamp).max()?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        Some(Chunk {
            sequence,
            chunk_id: format!("{}_{}_{}", self.source_id, sequence, slice[0].timestamp.timestamp_millis()),
            source_id: self.source_id.clone(),
            start,
            end: last,
            readings: slice.to_vec(),
        })
    }
}
