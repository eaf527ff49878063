//! Raw input readers.
//!
//! Turns long CSV, wide CSV, live messages and JSON lines into raw
//! `(tag, timestamp, value)` triples. Every tag is resolved against the
//! registry here; unknown tags never reach the normalizer.

use crate::error::{PipelineError, Result};
use crate::registry::TagRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const TAG_HEADERS: &[&str] = &["tag", "tag name", "tag_name", "tagname", "tag_id"];
const TIME_HEADERS: &[&str] = &["timestamp", "time", "ts", "datetime"];
const VALUE_HEADERS: &[&str] = &["value", "val"];
const QUALITY_HEADERS: &[&str] = &["quality", "q"];
/// Wide-form columns that never name a tag
const WIDE_SKIP_HEADERS: &[&str] = &["source_id", "source"];

/// Where a record came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOrigin {
    pub source: String,
    /// Zero-based data row, line or message index
    pub index: usize,
}

impl RecordOrigin {
    pub fn new(source: impl Into<String>, index: usize) -> Self {
        Self { source: source.into(), index }
    }
}

impl fmt::Display for RecordOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.index)
    }
}

/// Unvalidated reading whose tag is known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub tag: String,
    pub timestamp: JsonValue,
    pub value: JsonValue,
    pub quality: Option<String>,
    pub origin: RecordOrigin,
}

/// Live message as delivered by an upstream producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMessage {
    pub tag: String,
    pub timestamp: JsonValue,
    pub value: JsonValue,
    #[serde(default)]
    pub quality: Option<String>,
}

/// Either one tag message or a snapshot of several tags sharing a timestamp
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LiveRecord {
    Single(LiveMessage),
    Snapshot {
        timestamp: JsonValue,
        tags: serde_json::Map<String, JsonValue>,
        #[serde(default)]
        quality: Option<String>,
    },
}

impl LiveMessage {
    /// Decode a transport payload holding one message or one tag snapshot.
    pub fn decode(payload: &[u8]) -> Result<Vec<LiveMessage>> {
        Ok(match serde_json::from_slice::<LiveRecord>(payload)? {
            LiveRecord::Single(message) => vec![message],
            LiveRecord::Snapshot { timestamp, tags, quality } => tags
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(tag, value)| LiveMessage {
                    tag,
                    timestamp: timestamp.clone(),
                    value,
                    quality: quality.clone(),
                })
                .collect(),
        })
    }
}

/// Item on a live ingestion channel
#[derive(Debug, Clone, PartialEq)]
pub enum LiveInput {
    Message(LiveMessage),
    /// Transport payload that could not be decoded
    Malformed(Rejection),
}

impl From<LiveMessage> for LiveInput {
    fn from(message: LiveMessage) -> Self {
        LiveInput::Message(message)
    }
}

impl LiveInput {
    /// Decode a transport payload. An undecodable payload becomes a single
    /// malformed rejection carrying the payload itself.
    pub fn decode(payload: &[u8], origin: RecordOrigin) -> Vec<LiveInput> {
        match LiveMessage::decode(payload) {
            Ok(messages) => messages.into_iter().map(LiveInput::Message).collect(),
            Err(e) => {
                let raw = serde_json::from_slice::<JsonValue>(payload)
                    .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(payload).into_owned()));
                vec![LiveInput::Malformed(
                    Rejection::new(origin, RejectReason::Malformed, e.to_string()).with_payload(raw),
                )]
            }
        }
    }
}

/// Reason a record was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    UnknownTag,
    TypeMismatch,
    SchemaViolation,
    Malformed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::UnknownTag => "rejected-unknown-tag",
            RejectReason::TypeMismatch => "rejected-type-mismatch",
            RejectReason::SchemaViolation => "rejected-schema-violation",
            RejectReason::Malformed => "rejected-malformed",
        }
    }
}

/// A refused record, attributable to its origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub origin: RecordOrigin,
    pub tag: Option<String>,
    pub reason: RejectReason,
    pub detail: String,
    /// Original payload, kept for replay
    #[serde(default)]
    pub payload: Option<JsonValue>,
}

impl Rejection {
    pub fn new(origin: RecordOrigin, reason: RejectReason, detail: impl Into<String>) -> Self {
        Self { origin, tag: None, reason, detail: detail.into(), payload: None }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Raw CSV row kept with its rejection, so a repaired row can be replayed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvRow {
    pub headers: Vec<String>,
    pub fields: Vec<String>,
}

impl CsvRow {
    fn new(headers: &[String], fields: impl IntoIterator<Item = String>) -> Self {
        Self { headers: headers.to_vec(), fields: fields.into_iter().collect() }
    }

    fn payload(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Render the row as a two-line CSV document.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        writer.write_record(&self.fields)?;
        writer
            .into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))
    }
}

/// Decode a byte record as text. A record that is not valid UTF-8 is returned
/// as lossily decoded fields for the dead-letter payload.
fn decode_record(
    headers: &[String],
    record: csv::ByteRecord,
) -> std::result::Result<csv::StringRecord, (String, CsvRow)> {
    csv::StringRecord::from_byte_record(record).map_err(|e| {
        let detail = e.to_string();
        let fields = e
            .into_byte_record()
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect::<Vec<_>>();
        (detail, CsvRow::new(headers, fields))
    })
}

/// Result of reading one batch
#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    pub readings: Vec<RawReading>,
    pub rejections: Vec<Rejection>,
}

impl ReadOutcome {
    fn extend(&mut self, other: ReadOutcome) {
        self.readings.extend(other.readings);
        self.rejections.extend(other.rejections);
    }

    pub fn count(&self, reason: RejectReason) -> usize {
        self.rejections.iter().filter(|r| r.reason == reason).count()
    }

    /// Text record of a CSV row, or `None` after rejecting the row.
    fn take_record(
        &mut self,
        headers: &[String],
        record: csv::Result<csv::ByteRecord>,
        origin: &RecordOrigin,
    ) -> Option<csv::StringRecord> {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                self.rejections
                    .push(Rejection::new(origin.clone(), RejectReason::Malformed, e.to_string()));
                return None;
            }
        };
        match decode_record(headers, record) {
            Ok(record) => Some(record),
            Err((detail, row)) => {
                self.rejections.push(
                    Rejection::new(origin.clone(), RejectReason::Malformed, detail).with_payload(row.payload()),
                );
                None
            }
        }
    }
}

/// Input format, normally inferred from a file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    JsonLines,
    JsonArray,
}

impl InputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_lowercase().as_str() {
            "csv" => Some(InputFormat::Csv),
            "jsonl" | "ndjson" => Some(InputFormat::JsonLines),
            "json" => Some(InputFormat::JsonArray),
            _ => None,
        }
    }
}

/// Registry-validating reader
#[derive(Clone)]
pub struct Reader {
    registry: Arc<TagRegistry>,
}

impl Reader {
    pub fn new(registry: Arc<TagRegistry>) -> Self {
        Self { registry }
    }

    /// Read a file, choosing the format from its extension.
    pub fn read_path(&self, path: impl AsRef<Path>) -> Result<ReadOutcome> {
        let path = path.as_ref();
        let source = path.display().to_string();
        let format = InputFormat::from_path(path).ok_or_else(|| {
            PipelineError::Config(format!("unsupported input format: {}", source))
        })?;

        let file = std::fs::File::open(path)?;
        let outcome = match format {
            InputFormat::Csv => self.read_csv(&source, file)?,
            InputFormat::JsonLines => self.read_jsonl(&source, std::io::BufReader::new(file))?,
            InputFormat::JsonArray => {
                let records: Vec<JsonValue> = serde_json::from_reader(std::io::BufReader::new(file))?;
                self.read_json_values(&source, records)
            }
        };

        debug!(
            "Read {}: {} readings, {} rejections",
            source,
            outcome.readings.len(),
            outcome.rejections.len()
        );
        Ok(outcome)
    }

    /// Read CSV, detecting long form (tag, timestamp, value columns) or wide
    /// form (timestamp plus one column per tag).
    pub fn read_csv<R: std::io::Read>(&self, source: &str, input: R) -> Result<ReadOutcome> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(input);

        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
        let folded: Vec<String> = headers.iter().map(|h| h.to_lowercase()).collect();
        let find = |names: &[&str]| folded.iter().position(|h| names.contains(&h.as_str()));

        let tag_col = find(TAG_HEADERS);
        let time_col = find(TIME_HEADERS);
        let value_col = find(VALUE_HEADERS);
        let quality_col = find(QUALITY_HEADERS);

        match (tag_col, time_col, value_col) {
            (Some(tag), Some(time), Some(value)) => {
                self.read_long(source, &mut rdr, &headers, LongColumns { tag, time, value, quality: quality_col })
            }
            (_, Some(time), _) => self.read_wide(source, &mut rdr, &headers, time),
            _ => {
                warn!("{}: no timestamp column in headers {:?}", source, headers);
                let mut outcome = ReadOutcome::default();
                outcome.rejections.push(Rejection::new(
                    RecordOrigin::new(source, 0),
                    RejectReason::Malformed,
                    "no timestamp column",
                ));
                Ok(outcome)
            }
        }
    }

    fn read_long<R: std::io::Read>(
        &self,
        source: &str,
        rdr: &mut csv::Reader<R>,
        headers: &[String],
        cols: LongColumns,
    ) -> Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();

        for (index, record) in rdr.byte_records().enumerate() {
            let origin = RecordOrigin::new(source, index);
            let Some(record) = outcome.take_record(headers, record, &origin) else {
                continue;
            };

            let (Some(tag), Some(ts), Some(value)) =
                (record.get(cols.tag), record.get(cols.time), record.get(cols.value))
            else {
                outcome.rejections.push(
                    Rejection::new(
                        origin,
                        RejectReason::Malformed,
                        format!("expected at least {} fields", cols.required()),
                    )
                    .with_payload(CsvRow::new(headers, record.iter().map(str::to_string)).payload()),
                );
                continue;
            };
            let quality = cols
                .quality
                .and_then(|q| record.get(q))
                .filter(|q| !q.is_empty())
                .map(str::to_string);

            self.accept(
                &mut outcome,
                tag,
                JsonValue::String(ts.to_string()),
                JsonValue::String(value.to_string()),
                quality,
                origin,
            );
        }

        Ok(outcome)
    }

    fn read_wide<R: std::io::Read>(
        &self,
        source: &str,
        rdr: &mut csv::Reader<R>,
        headers: &[String],
        time_col: usize,
    ) -> Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();

        for (index, record) in rdr.byte_records().enumerate() {
            let origin = RecordOrigin::new(source, index);
            let Some(record) = outcome.take_record(headers, record, &origin) else {
                continue;
            };
            let Some(ts) = record.get(time_col).filter(|ts| !ts.is_empty()) else {
                outcome.rejections.push(
                    Rejection::new(origin, RejectReason::Malformed, "empty timestamp")
                        .with_payload(CsvRow::new(headers, record.iter().map(str::to_string)).payload()),
                );
                continue;
            };

            for (col, header) in headers.iter().enumerate() {
                if col == time_col || WIDE_SKIP_HEADERS.contains(&header.to_lowercase().as_str()) {
                    continue;
                }
                let Some(cell) = record.get(col).filter(|cell| !cell.is_empty()) else {
                    continue;
                };
                self.accept(
                    &mut outcome,
                    header,
                    JsonValue::String(ts.to_string()),
                    JsonValue::String(cell.to_string()),
                    None,
                    origin.clone(),
                );
            }
        }

        Ok(outcome)
    }

    /// Validate a single live message.
    pub fn read_message(
        &self,
        message: LiveMessage,
        origin: RecordOrigin,
    ) -> std::result::Result<RawReading, Rejection> {
        if !self.registry.contains(&message.tag) {
            debug!("Unknown tag '{}' at {}", message.tag, origin);
            return Err(Rejection::new(origin, RejectReason::UnknownTag, "tag not in registry")
                .with_tag(&message.tag)
                .with_payload(serde_json::to_value(&message).unwrap_or(JsonValue::Null)));
        }
        Ok(RawReading {
            tag: message.tag,
            timestamp: message.timestamp,
            value: message.value,
            quality: message.quality,
            origin,
        })
    }

    /// Validate a batch of live messages.
    pub fn read_messages(
        &self,
        source: &str,
        messages: impl IntoIterator<Item = LiveMessage>,
    ) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        for (index, message) in messages.into_iter().enumerate() {
            match self.read_message(message, RecordOrigin::new(source, index)) {
                Ok(raw) => outcome.readings.push(raw),
                Err(rejection) => outcome.rejections.push(rejection),
            }
        }
        outcome
    }

    /// Read JSON lines of live messages or tag snapshots. Blank lines are
    /// skipped; unparseable lines are rejected as malformed.
    pub fn read_jsonl<R: BufRead>(&self, source: &str, input: R) -> Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        for (index, line) in input.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let origin = RecordOrigin::new(source, index);
            match serde_json::from_str::<JsonValue>(&line) {
                Ok(value) => outcome.extend(self.read_json_value(value, origin)),
                Err(e) => outcome.rejections.push(
                    Rejection::new(origin, RejectReason::Malformed, e.to_string())
                        .with_payload(JsonValue::String(line)),
                ),
            }
        }
        Ok(outcome)
    }

    fn read_json_values(&self, source: &str, records: Vec<JsonValue>) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        for (index, value) in records.into_iter().enumerate() {
            outcome.extend(self.read_json_value(value, RecordOrigin::new(source, index)));
        }
        outcome
    }

    fn read_json_value(&self, value: JsonValue, origin: RecordOrigin) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        match serde_json::from_value::<LiveRecord>(value.clone()) {
            Ok(LiveRecord::Single(message)) => match self.read_message(message, origin) {
                Ok(raw) => outcome.readings.push(raw),
                Err(rejection) => outcome.rejections.push(rejection),
            },
            Ok(LiveRecord::Snapshot { timestamp, tags, quality }) => {
                for (tag, value) in tags {
                    if value.is_null() {
                        continue;
                    }
                    self.accept(&mut outcome, &tag, timestamp.clone(), value, quality.clone(), origin.clone());
                }
            }
            Err(e) => outcome.rejections.push(
                Rejection::new(origin, RejectReason::Malformed, e.to_string()).with_payload(value),
            ),
        }
        outcome
    }

    fn accept(
        &self,
        outcome: &mut ReadOutcome,
        tag: &str,
        timestamp: JsonValue,
        value: JsonValue,
        quality: Option<String>,
        origin: RecordOrigin,
    ) {
        if !self.registry.contains(tag) {
            debug!("Unknown tag '{}' at {}", tag, origin);
            outcome.rejections.push(
                Rejection::new(origin, RejectReason::UnknownTag, "tag not in registry")
                    .with_tag(tag)
                    .with_payload(serde_json::json!({
                        "tag": tag,
                        "timestamp": timestamp,
                        "value": value,
                        "quality": quality,
                    })),
            );
            return;
        }
        outcome.readings.push(RawReading {
            tag: tag.to_string(),
            timestamp,
            value,
            quality,
            origin,
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct LongColumns {
    tag: usize,
    time: usize,
    value: usize,
    quality: Option<usize>,
}

impl LongColumns {
    fn required(&self) -> usize {
        self.tag.max(self.time).max(self.value) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TagDefinition;
    use crate::value::DataType;

    fn reader() -> Reader {
        let registry = TagRegistry::from_definitions(vec![
            TagDefinition::new("T1", DataType::Numeric, "A1"),
            TagDefinition::new("T2", DataType::Boolean, "A1"),
        ])
        .unwrap();
        Reader::new(Arc::new(registry))
    }

    #[test]
    fn test_long_csv_with_aliases() {
        let csv = "timestamp,Tag Name,Value,Quality\n0,T1,90,good\n1,T9,5,\n2,T1,105,\n";
        let outcome = reader().read_csv("plant.csv", csv.as_bytes()).unwrap();

        assert_eq!(outcome.readings.len(), 2);
        assert_eq!(outcome.readings[0].tag, "T1");
        assert_eq!(outcome.readings[0].quality.as_deref(), Some("good"));
        assert_eq!(outcome.readings[1].value, JsonValue::String("105".into()));
        assert_eq!(outcome.readings[1].quality, None);

        assert_eq!(outcome.count(RejectReason::UnknownTag), 1);
        assert_eq!(outcome.rejections[0].origin, RecordOrigin::new("plant.csv", 1));
        assert_eq!(outcome.rejections[0].tag.as_deref(), Some("T9"));
    }

    #[test]
    fn test_wide_csv_skips_empty_cells() {
        let csv = "timestamp,source_id,T1,T2,T9\n0,CSV,1.5,true,3\n1,CSV,,false,\n";
        let outcome = reader().read_csv("wide.csv", csv.as_bytes()).unwrap();

        let tags: Vec<&str> = outcome.readings.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["T1", "T2", "T2"]);
        assert_eq!(outcome.count(RejectReason::UnknownTag), 1);
        assert_eq!(outcome.readings[2].origin.index, 1);
    }

    #[test]
    fn test_short_long_row_is_malformed() {
        let csv = "tag,timestamp,value\nT1,0\nT1,1,2\n";
        let outcome = reader().read_csv("short.csv", csv.as_bytes()).unwrap();
        assert_eq!(outcome.readings.len(), 1);
        assert_eq!(outcome.count(RejectReason::Malformed), 1);
    }

    #[test]
    fn test_malformed_rows_keep_raw_fields() {
        let csv = b"tag,timestamp,value\nT1,0\nT1,1,\xff\xfe\n".to_vec();
        let outcome = reader().read_csv("bad.csv", &csv[..]).unwrap();
        assert!(outcome.readings.is_empty());
        assert_eq!(outcome.count(RejectReason::Malformed), 2);

        let short: CsvRow = serde_json::from_value(outcome.rejections[0].payload.clone().unwrap()).unwrap();
        assert_eq!(short.headers, vec!["tag", "timestamp", "value"]);
        assert_eq!(short.fields, vec!["T1", "0"]);

        let binary: CsvRow = serde_json::from_value(outcome.rejections[1].payload.clone().unwrap()).unwrap();
        assert_eq!(binary.fields[0], "T1");
        assert_eq!(binary.fields[2], "\u{fffd}\u{fffd}");
    }

    #[test]
    fn test_repaired_row_reads_back() {
        let row = CsvRow {
            headers: vec!["tag".into(), "timestamp".into(), "value".into()],
            fields: vec!["T1".into(), "0".into(), "42".into()],
        };
        let outcome = reader().read_csv("dead-letter", &row.to_csv().unwrap()[..]).unwrap();
        assert_eq!(outcome.readings.len(), 1);
        assert_eq!(outcome.readings[0].value, JsonValue::String("42".into()));
    }

    #[test]
    fn test_jsonl_messages_and_snapshots() {
        let input = r#"{"tag":"T1","timestamp":0,"value":90}

not json
{"timestamp":"2024-01-01T00:00:00Z","source_id":"OPC","tags":{"T1":1.0,"T2":null,"X":2}}
{"tag":"T3","timestamp":1,"value":1}
"#;
        let outcome = reader().read_jsonl("live.jsonl", input.as_bytes()).unwrap();

        assert_eq!(outcome.readings.len(), 2);
        assert_eq!(outcome.count(RejectReason::Malformed), 1);
        assert_eq!(outcome.count(RejectReason::UnknownTag), 2);
        assert_eq!(outcome.rejections[0].origin.index, 2);
    }

    #[test]
    fn test_live_input_keeps_undecodable_payload() {
        let decoded = LiveInput::decode(br#"{"tag":"T1","timestamp":0,"value":1}"#, RecordOrigin::new("plant/t1", 0));
        assert!(matches!(&decoded[..], [LiveInput::Message(m)] if m.tag == "T1"));

        let decoded = LiveInput::decode(b"\x00garbage", RecordOrigin::new("plant/t1", 1));
        let [LiveInput::Malformed(rejection)] = &decoded[..] else {
            panic!("expected one malformed item, got {:?}", decoded);
        };
        assert_eq!(rejection.reason, RejectReason::Malformed);
        assert_eq!(rejection.origin, RecordOrigin::new("plant/t1", 1));
        assert_eq!(rejection.payload, Some(JsonValue::String("\u{0}garbage".into())));
    }

    #[test]
    fn test_read_message_unknown_tag() {
        let message = LiveMessage {
            tag: "nope".into(),
            timestamp: serde_json::json!(0),
            value: serde_json::json!(1),
            quality: None,
        };
        let rejection = reader().read_message(message, RecordOrigin::new("mqtt", 7)).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::UnknownTag);
        assert!(rejection.payload.is_some());
    }

    #[test]
    fn test_read_path_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, r#"[{"tag":"T1","timestamp":0,"value":1},{"tag":"T2","timestamp":0,"value":true}]"#)
            .unwrap();
        let outcome = reader().read_path(&path).unwrap();
        assert_eq!(outcome.readings.len(), 2);

        let bad = dir.path().join("batch.parquet");
        std::fs::write(&bad, b"").unwrap();
        assert!(reader().read_path(&bad).is_err());
    }
}
