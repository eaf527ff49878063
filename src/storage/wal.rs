// src/storage/wal.rs - Alarm state write-ahead log
//
// Frame layout (big endian):
//   len u32 | timestamp_us i64 | tag_len u16 | tag | state u8
// `len` counts the bytes after itself. A frame cut short by a crash is
// ignored on recovery, together with anything after it, and truncated away
// when the log is reopened for appending.

use crate::alarms::{AlarmState, PersistedState, StateStore};
use crate::dispatcher::shard_for;
use crate::error::{PipelineError, Result};
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "alarm-state-";
const FILE_SUFFIX: &str = ".wal";
const MIN_FRAME: usize = 8 + 2 + 1;

#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub tag: String,
    pub state: AlarmState,
    pub timestamp: DateTime<Utc>,
}

/// Append-only, fsync-per-append log file
pub struct WriteAheadLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl WriteAheadLog {
    /// Open for appending. Bytes after the last complete frame are cut off
    /// first so new frames never land behind a torn one.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        let (_, valid) = read_frames(&path)?;
        if (valid as u64) < size {
            warn!("Truncating {} from {} to {} bytes", path.display(), size, valid);
            file.set_len(valid as u64)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;
        debug!("WAL opened at {}", path.display());
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and sync it to disk.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let frame = encode_frame(entry)?;
        let mut file = self.file.lock();
        file.write_all(&frame)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read every complete frame.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        read_entries(&self.path)
    }

    /// Atomically replace the log with `entries`.
    pub fn compact<'a>(&self, entries: impl IntoIterator<Item = &'a WalEntry>) -> Result<()> {
        let tmp = self.path.with_extension("wal.tmp");
        let mut count = 0usize;
        {
            let mut out = File::create(&tmp)?;
            for entry in entries {
                out.write_all(&encode_frame(entry)?)?;
                count += 1;
            }
            out.sync_all()?;
        }

        let mut file = self.file.lock();
        std::fs::rename(&tmp, &self.path)?;
        *file = OpenOptions::new().append(true).open(&self.path)?;
        debug!("WAL {} compacted to {} entries", self.path.display(), count);
        Ok(())
    }
}

fn encode_frame(entry: &WalEntry) -> Result<Vec<u8>> {
    let tag = entry.tag.as_bytes();
    let tag_len = u16::try_from(tag.len()).map_err(|_| PipelineError::Corrupt {
        location: "alarm state WAL".into(),
        reason: format!("tag '{}' too long for a WAL frame", entry.tag),
    })?;

    let body_len = MIN_FRAME + tag.len();
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_i64(entry.timestamp.timestamp_micros());
    buf.put_u16(tag_len);
    buf.put_slice(tag);
    buf.put_u8(entry.state.to_u8());
    Ok(buf.to_vec())
}

fn decode_frame(mut body: &[u8]) -> Option<WalEntry> {
    if body.remaining() < MIN_FRAME {
        return None;
    }
    let micros = body.get_i64();
    let tag_len = body.get_u16() as usize;
    if body.remaining() != tag_len + 1 {
        return None;
    }
    let tag = String::from_utf8(body[..tag_len].to_vec()).ok()?;
    body.advance(tag_len);
    let state = AlarmState::from_u8(body.get_u8())?;
    let timestamp = DateTime::<Utc>::from_timestamp_micros(micros)?;
    Some(WalEntry { tag, state, timestamp })
}

fn read_entries(path: &Path) -> Result<Vec<WalEntry>> {
    read_frames(path).map(|(entries, _)| entries)
}

/// Complete frames of the log and the byte length they cover
fn read_frames(path: &Path) -> Result<(Vec<WalEntry>, usize)> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let mut buf = &data[..];
    let mut entries = Vec::new();
    let mut valid = 0usize;
    while buf.remaining() >= 4 {
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.remaining() < 4 + len {
            break;
        }
        buf.advance(4);
        match decode_frame(&buf[..len]) {
            Some(entry) => entries.push(entry),
            None => {
                warn!("Corrupt frame in {}, ignoring the rest of the log", path.display());
                return Ok((entries, valid));
            }
        }
        buf.advance(len);
        valid += 4 + len;
    }
    if buf.has_remaining() {
        warn!("Ignoring {} byte torn tail in {}", buf.remaining(), path.display());
    }
    Ok((entries, valid))
}

/// [`StateStore`] backed by one WAL file per alarm shard.
///
/// Recovery reads every shard file in the directory and keeps the latest
/// entry per tag, so a change of shard count does not lose state.
pub struct WalStateStore {
    dir: PathBuf,
    shard: usize,
    shards: usize,
    wal: WriteAheadLog,
}

impl WalStateStore {
    pub fn open<P: AsRef<Path>>(dir: P, shard: usize, shards: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let wal = WriteAheadLog::open(dir.join(format!("{}{}{}", FILE_PREFIX, shard, FILE_SUFFIX)))?;
        Ok(Self { dir, shard, shards: shards.max(1), wal })
    }
}

impl StateStore for WalStateStore {
    fn load(&mut self) -> Result<HashMap<String, PersistedState>> {
        let mut states: HashMap<String, PersistedState> = HashMap::new();
        let mut files = 0usize;

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_wal = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX));
            if !is_wal {
                continue;
            }
            files += 1;

            for entry in read_entries(&path)? {
                if shard_for(&entry.tag, self.shards) != self.shard {
                    continue;
                }
                let newer = states
                    .get(&entry.tag)
                    .map_or(true, |s| entry.timestamp >= s.timestamp);
                if newer {
                    states.insert(
                        entry.tag,
                        PersistedState { state: entry.state, timestamp: entry.timestamp },
                    );
                }
            }
        }

        info!(
            "Shard {} recovered {} tag states from {} WAL files",
            self.shard,
            states.len(),
            files
        );
        Ok(states)
    }

    fn persist(&mut self, tag: &str, state: PersistedState) -> Result<()> {
        self.wal.append(&WalEntry {
            tag: tag.to_string(),
            state: state.state,
            timestamp: state.timestamp,
        })
    }

    fn checkpoint(&mut self, states: &HashMap<String, PersistedState>) -> Result<()> {
        let mut entries: Vec<WalEntry> = states
            .iter()
            .map(|(tag, s)| WalEntry { tag: tag.clone(), state: s.state, timestamp: s.timestamp })
            .collect();
        entries.sort_by(|a, b| a.tag.cmp(&b.tag));
        self.wal.compact(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(tag: &str, state: AlarmState, secs: i64) -> WalEntry {
        WalEntry {
            tag: tag.into(),
            state,
            timestamp: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("a.wal")).unwrap();
        wal.append(&entry("T1", AlarmState::High, 1)).unwrap();
        wal.append(&entry("T2", AlarmState::Low, 2)).unwrap();

        let entries = wal.read_all().unwrap();
        assert_eq!(entries, vec![entry("T1", AlarmState::High, 1), entry("T2", AlarmState::Low, 2)]);
    }

    #[test]
    fn test_torn_tail_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wal");
        let wal = WriteAheadLog::open(&path).unwrap();
        wal.append(&entry("T1", AlarmState::High, 1)).unwrap();

        let mut frame = encode_frame(&entry("T1", AlarmState::Normal, 2)).unwrap();
        frame.truncate(frame.len() - 3);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame).unwrap();

        let entries = wal.read_all().unwrap();
        assert_eq!(entries, vec![entry("T1", AlarmState::High, 1)]);
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wal");
        {
            let wal = WriteAheadLog::open(&path).unwrap();
            wal.append(&entry("T1", AlarmState::High, 1)).unwrap();
        }
        let clean_len = std::fs::metadata(&path).unwrap().len();

        let mut frame = encode_frame(&entry("T1", AlarmState::Normal, 2)).unwrap();
        frame.truncate(frame.len() - 3);
        OpenOptions::new().append(true).open(&path).unwrap().write_all(&frame).unwrap();

        let wal = WriteAheadLog::open(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
        wal.append(&entry("T1", AlarmState::Normal, 3)).unwrap();
        assert_eq!(
            wal.read_all().unwrap(),
            vec![entry("T1", AlarmState::High, 1), entry("T1", AlarmState::Normal, 3)]
        );
    }

    #[test]
    fn test_state_survives_second_restart_after_torn_write() {
        let dir = TempDir::new().unwrap();
        let state = |s, secs| PersistedState {
            state: s,
            timestamp: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
        };
        let wal_path = dir.path().join(format!("{}0{}", FILE_PREFIX, FILE_SUFFIX));

        {
            let mut store = WalStateStore::open(dir.path(), 0, 1).unwrap();
            store.persist("T1", state(AlarmState::High, 1)).unwrap();
        }
        let mut frame = encode_frame(&entry("T1", AlarmState::Low, 2)).unwrap();
        frame.truncate(frame.len() - 3);
        OpenOptions::new().append(true).open(&wal_path).unwrap().write_all(&frame).unwrap();

        {
            let mut store = WalStateStore::open(dir.path(), 0, 1).unwrap();
            assert_eq!(store.load().unwrap()["T1"], state(AlarmState::High, 1));
            store.persist("T1", state(AlarmState::Normal, 3)).unwrap();
        }

        let mut store = WalStateStore::open(dir.path(), 0, 1).unwrap();
        assert_eq!(store.load().unwrap()["T1"], state(AlarmState::Normal, 3));
    }

    #[test]
    fn test_compact_keeps_appending() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("a.wal")).unwrap();
        for i in 0..5 {
            wal.append(&entry("T1", AlarmState::High, i)).unwrap();
        }
        wal.compact(&[entry("T1", AlarmState::High, 4)]).unwrap();
        wal.append(&entry("T1", AlarmState::Normal, 5)).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_state_store_recovers_latest_per_tag() {
        let dir = TempDir::new().unwrap();
        let state = |s, secs| PersistedState {
            state: s,
            timestamp: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
        };

        {
            let mut store = WalStateStore::open(dir.path(), 0, 1).unwrap();
            store.persist("T1", state(AlarmState::High, 1)).unwrap();
            store.persist("T1", state(AlarmState::Normal, 3)).unwrap();
            store.persist("T2", state(AlarmState::Low, 2)).unwrap();
        }

        let mut store = WalStateStore::open(dir.path(), 0, 1).unwrap();
        let states = store.load().unwrap();
        assert_eq!(states["T1"], state(AlarmState::Normal, 3));
        assert_eq!(states["T2"], state(AlarmState::Low, 2));

        store.checkpoint(&states).unwrap();
        assert_eq!(store.load().unwrap(), states);
    }
}
