//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Append-only CSV log of readings.
//!
//! Layout: a marker line ([`LOG_MARKER`]), a header row
//! `timestamp,device_address,<parameters...>` and one newline-terminated row
//! per reading. Absent parameters are empty fields. A final line without a
//! newline is a torn append: readers never return it and the next writer
//! truncates it.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use r_gw_common::config::{DEVICE_COLUMN, TIMESTAMP_COLUMN};
use r_gw_common::time::format_timestamp;
use r_gw_common::{DeviceAddress, Reading};
use tracing::{debug, warn};

use crate::fsutil::ensure_parent;
use crate::{PersistenceError, Result};

/// First line of every reading log.
pub const LOG_MARKER: &str = "#reading-log v1";

const SCAN_CHUNK: u64 = 4096;

fn header_fields(parameters: &[String]) -> Vec<&str> {
    let mut fields = vec![TIMESTAMP_COLUMN, DEVICE_COLUMN];
    fields.extend(parameters.iter().map(String::as_str));
    fields
}

fn encode_line<I, T>(fields: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    writer.into_inner().map_err(|err| {
        PersistenceError::Io(io::Error::new(err.error().kind(), err.error().to_string()))
    })
}

fn decode_line(line: &[u8]) -> Result<Option<csv::StringRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line);
    let mut record = csv::StringRecord::new();
    if reader.read_record(&mut record)? {
        Ok(Some(record))
    } else {
        Ok(None)
    }
}

fn preamble(parameters: &[String]) -> Result<Vec<u8>> {
    let mut bytes = format!("{LOG_MARKER}\n").into_bytes();
    bytes.extend(encode_line(header_fields(parameters))?);
    Ok(bytes)
}

/// Reads and validates the marker and header. Returns the byte offset of
/// the first data row, or `None` when the preamble is not fully written yet.
fn read_preamble<R: BufRead>(reader: &mut R, path: &Path, parameters: &[String]) -> Result<Option<u64>> {
    let mut marker = Vec::new();
    reader.read_until(b'\n', &mut marker)?;
    if !marker.ends_with(b"\n") {
        return Ok(None);
    }
    if trim_newline(&marker) != LOG_MARKER.as_bytes() {
        return Err(PersistenceError::Corrupt {
            path: path.to_path_buf(),
            offset: 0,
            reason: format!(
                "expected marker '{LOG_MARKER}', found '{}'",
                String::from_utf8_lossy(trim_newline(&marker))
            ),
        });
    }

    let mut header = Vec::new();
    reader.read_until(b'\n', &mut header)?;
    if !header.ends_with(b"\n") {
        return Ok(None);
    }
    let expected = header_fields(parameters);
    let found = decode_line(&header)?.unwrap_or_default();
    if found.iter().ne(expected.iter().copied()) {
        return Err(PersistenceError::Schema {
            path: path.to_path_buf(),
            expected: expected.join(","),
            found: found.iter().collect::<Vec<_>>().join(","),
        });
    }
    Ok(Some((marker.len() + header.len()) as u64))
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Length of the file up to and including its last newline.
fn committed_len(file: &mut File, len: u64) -> io::Result<u64> {
    let mut end = len;
    let mut chunk = vec![0u8; SCAN_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(SCAN_CHUNK);
        let size = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk[..size])?;
        if let Some(pos) = chunk[..size].iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Single writer of the reading log.
#[derive(Debug)]
pub struct ReadingLogWriter {
    path: PathBuf,
    file: File,
    parameters: Vec<String>,
    data_start: u64,
    len: u64,
}

impl ReadingLogWriter {
    /// Open (or create) the log for `parameters`, in this column order.
    ///
    /// An existing log must carry the same header; a torn final row is
    /// truncated away.
    pub fn open(path: &Path, parameters: &[String]) -> Result<Self> {
        ensure_parent(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let mut len = file.metadata()?.len();

        let committed = committed_len(&mut file, len)?;
        if committed < len {
            warn!(log = %path.display(), torn_bytes = len - committed, "truncating torn tail");
            file.set_len(committed)?;
            file.sync_data()?;
            len = committed;
        }

        let existing = if len == 0 {
            None
        } else {
            file.seek(SeekFrom::Start(0))?;
            let mut reader = BufReader::new(&mut file);
            read_preamble(&mut reader, path, parameters)?
        };

        let data_start = match existing {
            Some(data_start) => data_start,
            None => {
                // Empty, or only the marker survived a crash during creation.
                file.set_len(0)?;
                let bytes = preamble(parameters)?;
                file.write_all(&bytes)?;
                file.sync_data()?;
                len = bytes.len() as u64;
                debug!(log = %path.display(), "reading log initialised");
                len
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            parameters: parameters.to_vec(),
            data_start,
            len,
        })
    }

    /// Durably append one reading and return the byte offset of its row.
    /// Values for parameters outside the configured set are not stored.
    pub fn append(&mut self, reading: &Reading) -> Result<u64> {
        let mut fields = Vec::with_capacity(self.parameters.len() + 2);
        fields.push(format_timestamp(&reading.timestamp));
        fields.push(reading.device.to_string());
        for name in &self.parameters {
            fields.push(
                reading
                    .values
                    .get(name)
                    .map(|value| value.to_string())
                    .unwrap_or_default(),
            );
        }
        let row = encode_line(&fields)?;
        let offset = self.len;
        self.file.write_all(&row)?;
        self.file.sync_data()?;
        self.len += row.len() as u64;
        Ok(offset)
    }

    /// Current committed length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the log holds no readings yet.
    pub fn is_empty(&self) -> bool {
        self.len == self.data_start
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One committed row together with its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Byte offset of the row.
    pub position: u64,
    /// Byte offset of the following row; a cursor at this value resumes
    /// after this record.
    pub next: u64,
    /// Decoded reading.
    pub reading: Reading,
}

/// Tailing reader of the reading log. Holds no open file between calls.
#[derive(Debug, Clone)]
pub struct ReadingLogReader {
    path: PathBuf,
    parameters: Vec<String>,
}

impl ReadingLogReader {
    /// Reader for a log written with `parameters`.
    pub fn new(path: &Path, parameters: &[String]) -> Self {
        Self {
            path: path.to_path_buf(),
            parameters: parameters.to_vec(),
        }
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records at or after `cursor`, up to the file length at call time.
    /// A cursor of 0 starts at the first data row. A missing file or an
    /// unfinished preamble yields no records.
    pub fn read_from(&self, cursor: u64) -> Result<LogTail> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(LogTail::empty(&self.path, cursor))
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata()?.len();
        if cursor > len {
            return Err(PersistenceError::CursorBeyondEnd {
                path: self.path.clone(),
                cursor,
                len,
            });
        }

        let data_start = {
            let mut reader = BufReader::new(&mut file);
            read_preamble(&mut reader, &self.path, &self.parameters)?
        };
        let Some(data_start) = data_start else {
            return Ok(LogTail::empty(&self.path, cursor));
        };

        let start = cursor.max(data_start);
        file.seek(SeekFrom::Start(start))?;
        Ok(LogTail {
            path: self.path.clone(),
            parameters: self.parameters.clone(),
            reader: Some(BufReader::new(file.take(len - start))),
            position: start,
        })
    }
}

/// Finite iterator over committed records. Stops at the first error.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    parameters: Vec<String>,
    reader: Option<BufReader<Take<File>>>,
    position: u64,
}

impl LogTail {
    fn empty(path: &Path, position: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            parameters: Vec::new(),
            reader: None,
            position,
        }
    }

    /// Offset just past the last record returned so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn corrupt(&self, offset: u64, reason: impl Into<String>) -> PersistenceError {
        PersistenceError::Corrupt {
            path: self.path.clone(),
            offset,
            reason: reason.into(),
        }
    }

    fn decode(&self, offset: u64, line: &[u8]) -> Result<Reading> {
        let record = decode_line(line)?.ok_or_else(|| self.corrupt(offset, "empty row"))?;
        let expected = self.parameters.len() + 2;
        if record.len() != expected {
            return Err(self.corrupt(
                offset,
                format!("expected {expected} fields, found {}", record.len()),
            ));
        }
        let timestamp = DateTime::parse_from_rfc3339(&record[0])
            .map_err(|err| self.corrupt(offset, format!("timestamp: {err}")))?
            .with_timezone(&Utc);
        let device: DeviceAddress = record[1]
            .parse()
            .map_err(|err| self.corrupt(offset, format!("{err}")))?;

        let mut values = IndexMap::with_capacity(self.parameters.len());
        for (name, raw) in self.parameters.iter().zip(record.iter().skip(2)) {
            if raw.is_empty() {
                continue;
            }
            let value = raw
                .parse::<f32>()
                .map_err(|err| self.corrupt(offset, format!("parameter {name}: {err}")))?;
            values.insert(name.clone(), value);
        }
        Ok(Reading {
            timestamp,
            device,
            values,
        })
    }
}

impl Iterator for LogTail {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut line = Vec::new();
        let read = match reader.read_until(b'\n', &mut line) {
            Ok(read) => read,
            Err(err) => {
                self.reader = None;
                return Some(Err(err.into()));
            }
        };
        if read == 0 || !line.ends_with(b"\n") {
            // End of the committed region, or a torn append.
            self.reader = None;
            return None;
        }

        let position = self.position;
        match self.decode(position, &line) {
            Ok(reading) => {
                self.position += read as u64;
                Some(Ok(LogRecord {
                    position,
                    next: self.position,
                    reading,
                }))
            }
            Err(err) => {
                self.reader = None;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;

    fn params() -> Vec<String> {
        ["current", "voltage"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn new_log_starts_with_marker_and_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/data.csv");
        let writer = ReadingLogWriter::open(&path, &params()).unwrap();
        assert!(writer.is_empty());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "#reading-log v1\ntimestamp,device_address,current,voltage\n"
        );
    }

    #[test]
    fn absent_parameter_is_an_empty_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let mut writer = ReadingLogWriter::open(&path, &params()).unwrap();
        let mut values = IndexMap::new();
        values.insert("voltage".to_owned(), 230.5f32);
        let ts = DateTime::parse_from_rfc3339("2024-03-01T12:00:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let device = DeviceAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 502);
        writer
            .append(&Reading::new(device, values).with_timestamp(ts))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with("2024-03-01T12:00:00.250Z,192.168.1.10,,230.5\n"));

        let record = ReadingLogReader::new(&path, &params())
            .read_from(0)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(record.reading.timestamp, ts);
        assert!(!record.reading.values.contains_key("current"));
        assert_eq!(record.reading.values["voltage"], 230.5);
    }

    #[test]
    fn header_mismatch_is_schema_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        ReadingLogWriter::open(&path, &params()).unwrap();
        let other = vec!["power".to_owned()];
        assert!(matches!(
            ReadingLogWriter::open(&path, &other),
            Err(PersistenceError::Schema { .. })
        ));
        assert!(matches!(
            ReadingLogReader::new(&path, &other).read_from(0),
            Err(PersistenceError::Schema { .. })
        ));
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let dir = tempdir().unwrap();
        let reader = ReadingLogReader::new(&dir.path().join("absent.csv"), &params());
        assert_eq!(reader.read_from(0).unwrap().count(), 0);
    }
}
