//! Line records of the store file.
//!
//! Every line is one JSON object tagged by its `type` field. The first
//! non-blank line of a store file must be the marker record.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::error::{KgError, Result};
use crate::graph::{Entity, Relation};

/// `type` tag of the marker record.
pub const MARKER_TYPE: &str = "_kgmem";

/// `source` written into new marker records.
pub const MARKER_SOURCE: &str = "kgmem-rs";

/// A decoded store line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreRecord {
    #[serde(rename = "_kgmem")]
    Marker {
        #[serde(default)]
        source: String,
    },
    #[serde(rename = "entity")]
    Entity(Entity),
    #[serde(rename = "relation")]
    Relation(Relation),
}

/// Borrowing twin of [`StoreRecord`] used on the write path.
#[derive(Serialize)]
#[serde(tag = "type")]
pub(crate) enum RecordRef<'a> {
    #[serde(rename = "_kgmem")]
    Marker { source: &'a str },
    #[serde(rename = "entity")]
    Entity(&'a Entity),
    #[serde(rename = "relation")]
    Relation(&'a Relation),
}

impl RecordRef<'static> {
    pub(crate) fn marker() -> Self {
        RecordRef::Marker {
            source: MARKER_SOURCE,
        }
    }
}

/// Write one record followed by a newline.
pub(crate) fn write_record<W: Write>(writer: &mut W, record: &RecordRef<'_>) -> Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Decode one non-blank line. `line_no` is 1-based and only used for errors.
pub fn parse_record(line: &str, line_no: usize) -> Result<StoreRecord> {
    serde_json::from_str(line).map_err(|e| KgError::CorruptRecord {
        line: line_no,
        reason: e.to_string(),
    })
}

pub fn is_marker_line(line: &str) -> bool {
    matches!(parse_record(line, 0), Ok(StoreRecord::Marker { .. }))
}

/// Iterator over the records of a store file.
///
/// Checks the marker before yielding anything. Yields
/// `Err(KgError::CorruptRecord)` for undecodable lines (bad JSON or bad
/// UTF-8) and keeps going, so callers can log and skip them.
/// `UnsafeStoreFile` and I/O errors end the iteration.
pub struct RecordReader<R> {
    reader: R,
    buf: Vec<u8>,
    path: PathBuf,
    line_no: usize,
    marker_seen: bool,
    done: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R, path: &Path) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            path: path.to_path_buf(),
            line_no: 0,
            marker_seen: false,
            done: false,
        }
    }

    fn unsafe_file(&mut self) -> KgError {
        self.done = true;
        KgError::UnsafeStoreFile {
            path: self.path.clone(),
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<StoreRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
            self.line_no += 1;

            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    if !self.marker_seen {
                        return Some(Err(self.unsafe_file()));
                    }
                    return Some(Err(KgError::CorruptRecord {
                        line: self.line_no,
                        reason: format!("invalid UTF-8: {}", e),
                    }));
                }
            };
            if line.is_empty() {
                continue;
            }

            if !self.marker_seen {
                if is_marker_line(line) {
                    self.marker_seen = true;
                    continue;
                }
                return Some(Err(self.unsafe_file()));
            }

            return Some(parse_record(line, self.line_no));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(content: &str) -> Vec<Result<StoreRecord>> {
        RecordReader::new(Cursor::new(content.to_string()), Path::new("test.jsonl")).collect()
    }

    #[test]
    fn test_record_wire_format() {
        let entity = Entity::new("A", "person", vec!["x".to_string()]);
        let mut buf = Vec::new();
        write_record(&mut buf, &RecordRef::Entity(&entity)).unwrap();
        let line = String::from_utf8(buf).unwrap();
        assert!(line.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "entity");
        assert_eq!(value["name"], "A");
        assert_eq!(value["entityType"], "person");

        let relation = Relation::new("A", "B", "leads");
        let mut buf = Vec::new();
        write_record(&mut buf, &RecordRef::Relation(&relation)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["type"], "relation");
        assert_eq!(value["from"], "A");
        assert_eq!(value["relationType"], "leads");

        let mut buf = Vec::new();
        write_record(&mut buf, &RecordRef::marker()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["type"], MARKER_TYPE);
        assert_eq!(value["source"], MARKER_SOURCE);
    }

    #[test]
    fn test_reader_skips_marker_and_decodes_records() {
        let content = concat!(
            r#"{"type":"_kgmem","source":"kgmem-rs"}"#,
            "\n",
            r#"{"type":"entity","name":"A","entityType":"person","observations":["x"]}"#,
            "\n\n",
            r#"{"type":"relation","from":"A","to":"B","relationType":"knows"}"#,
            "\n",
        );
        let records: Vec<StoreRecord> = read_all(content).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], StoreRecord::Entity(e) if e.name == "A"));
        assert!(matches!(&records[1], StoreRecord::Relation(r) if r.to_entity == "B"));
    }

    #[test]
    fn test_reader_rejects_missing_marker() {
        let content = r#"{"type":"entity","name":"A","entityType":"person","observations":[]}"#;
        let records = read_all(content);
        assert_eq!(records.len(), 1, "iteration must stop after the marker failure");
        assert!(matches!(records[0], Err(KgError::UnsafeStoreFile { .. })));
    }

    #[test]
    fn test_reader_reports_corrupt_lines_and_continues() {
        let content = concat!(
            r#"{"type":"_kgmem","source":"kgmem-rs"}"#,
            "\n",
            "{not json at all\n",
            r#"{"type":"mystery","name":"A"}"#,
            "\n",
            r#"{"type":"entity","name":"B","entityType":"t"}"#,
            "\n",
        );
        let records = read_all(content);
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], Err(KgError::CorruptRecord { line: 2, .. })));
        assert!(matches!(records[1], Err(KgError::CorruptRecord { line: 3, .. })));
        match &records[2] {
            Ok(StoreRecord::Entity(e)) => {
                assert_eq!(e.name, "B");
                assert!(e.observations.is_empty(), "missing observations default to empty");
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_reader_isolates_invalid_utf8_line() {
        let mut content = Vec::new();
        content.extend_from_slice(br#"{"type":"_kgmem","source":"kgmem-rs"}"#);
        content.extend_from_slice(b"\n\xff\xfe garbage\n");
        content.extend_from_slice(br#"{"type":"entity","name":"B","entityType":"t"}"#);
        content.push(b'\n');

        let records: Vec<_> =
            RecordReader::new(Cursor::new(content), Path::new("test.jsonl")).collect();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], Err(KgError::CorruptRecord { line: 2, .. })));
        assert!(matches!(&records[1], Ok(StoreRecord::Entity(e)) if e.name == "B"));
    }

    #[test]
    fn test_reader_invalid_utf8_before_marker_is_unsafe() {
        let records: Vec<_> =
            RecordReader::new(Cursor::new(b"\xff\n".to_vec()), Path::new("test.jsonl")).collect();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], Err(KgError::UnsafeStoreFile { .. })));
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(read_all("").is_empty());
        assert!(read_all("\n  \n").is_empty());
    }
}
