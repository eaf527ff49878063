// src/storage/dead_letter.rs - Directory of parked records awaiting replay
//
// Each park writes one JSON-lines file through a temp file and an atomic
// rename, so a reader never sees a partial file. Draining renames a file to
// `.processing`; it is deleted once replayed or renamed back otherwise.

use crate::error::{PipelineError, Result};
use crate::graph::GraphItem;
use crate::normalizer::Reading;
use crate::reader::Rejection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PARKED_EXT: &str = "jsonl";
const PROCESSING_EXT: &str = "processing";
const TMP_EXT: &str = "tmp";

/// What was parked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeadLetterPayload {
    /// A record refused by the reader, normalizer or schema check
    Rejection(Rejection),
    /// A chunk of readings the sink did not accept
    Readings { chunk_id: String, readings: Vec<Reading> },
    /// Graph items that could not be committed
    Graph { items: Vec<GraphItem> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub parked_at: DateTime<Utc>,
    pub reason: String,
    pub payload: DeadLetterPayload,
}

impl DeadLetter {
    pub fn new(reason: impl Into<String>, payload: DeadLetterPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            parked_at: Utc::now(),
            reason: reason.into(),
            payload,
        }
    }

    pub fn rejection(rejection: Rejection) -> Self {
        Self::new(rejection.reason.as_str(), DeadLetterPayload::Rejection(rejection))
    }
}

/// A file taken out of the queue for replay
#[derive(Debug)]
pub struct DrainedFile {
    pub path: PathBuf,
    pub letters: Vec<DeadLetter>,
}

pub struct DeadLetterQueue {
    dir: PathBuf,
}

impl DeadLetterQueue {
    /// Open the queue directory. Files left in `.processing` by an
    /// interrupted replay are returned to the queue.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let queue = Self { dir };

        let mut recovered = 0usize;
        for path in queue.files_with(PROCESSING_EXT)? {
            std::fs::rename(&path, path.with_extension(PARKED_EXT))?;
            recovered += 1;
        }
        for path in queue.files_with(TMP_EXT)? {
            std::fs::remove_file(&path)?;
        }
        if recovered > 0 {
            warn!("Returned {} interrupted dead-letter files to {}", recovered, queue.dir.display());
        }
        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `letters` as one file. Returns `None` when there is nothing to park.
    pub fn park(&self, letters: &[DeadLetter]) -> Result<Option<PathBuf>> {
        if letters.is_empty() {
            return Ok(None);
        }

        let stem = format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%.6f"), Uuid::new_v4().simple());
        let tmp = self.dir.join(format!("{}.{}", stem, TMP_EXT));
        let path = self.dir.join(format!("{}.{}", stem, PARKED_EXT));

        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for letter in letters {
                serde_json::to_writer(&mut out, letter)?;
                out.write_all(b"\n")?;
            }
            let file = out.into_inner().map_err(|e| PipelineError::Io(e.into_error()))?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        debug!("Parked {} dead letters in {}", letters.len(), path.display());
        Ok(Some(path))
    }

    /// Parked files, oldest first
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        self.files_with(PARKED_EXT)
    }

    /// Number of parked letters
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for path in self.list()? {
            total += read_letters(&path)?.len();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.list()?.is_empty())
    }

    /// Take every parked file out of the queue.
    pub fn drain(&self) -> Result<Vec<DrainedFile>> {
        let mut drained = Vec::new();
        for path in self.list()? {
            let processing = path.with_extension(PROCESSING_EXT);
            std::fs::rename(&path, &processing)?;
            match read_letters(&processing) {
                Ok(letters) => drained.push(DrainedFile { path: processing, letters }),
                Err(e) => {
                    std::fs::rename(&processing, &path)?;
                    return Err(e);
                }
            }
        }
        if !drained.is_empty() {
            info!("Drained {} dead-letter files from {}", drained.len(), self.dir.display());
        }
        Ok(drained)
    }

    /// Drop a drained file after a successful replay.
    pub fn complete(&self, file: DrainedFile) -> Result<()> {
        std::fs::remove_file(&file.path)?;
        Ok(())
    }

    /// Return a drained file to the queue unchanged.
    pub fn restore(&self, file: DrainedFile) -> Result<()> {
        std::fs::rename(&file.path, file.path.with_extension(PARKED_EXT))?;
        Ok(())
    }

    fn files_with(&self, ext: &str) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ext) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn read_letters(path: &Path) -> Result<Vec<DeadLetter>> {
    let reader = BufReader::new(File::open(path)?);
    let mut letters = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let letter = serde_json::from_str(&line).map_err(|e| PipelineError::Corrupt {
            location: format!("{}:{}", path.display(), index + 1),
            reason: e.to_string(),
        })?;
        letters.push(letter);
    }
    Ok(letters)
}
