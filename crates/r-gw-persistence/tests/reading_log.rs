//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "integration-tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Integration tests for the durable reading log."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use indexmap::IndexMap;
use r_gw_common::{DeviceAddress, Reading};
use r_gw_persistence::{CursorStore, ReadingLogReader, ReadingLogWriter};
use tempfile::tempdir;

fn parameters() -> Vec<String> {
    ["current", "voltage", "temperature", "power"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn reading(seq: u32) -> Reading {
    let device = DeviceAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10 + (seq % 3) as u8)), 502);
    let mut values = IndexMap::new();
    values.insert("current".to_owned(), seq as f32 * 0.5);
    values.insert("voltage".to_owned(), 230.0 + seq as f32);
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(seq as i64);
    Reading::new(device, values).with_timestamp(ts)
}

#[test]
fn appended_readings_come_back_in_order() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("modbus_data.csv");
    let mut writer = ReadingLogWriter::open(&path, &parameters())?;
    let written: Vec<Reading> = (0..25).map(reading).collect();
    let mut offsets = Vec::new();
    for r in &written {
        offsets.push(writer.append(r)?);
    }

    let reader = ReadingLogReader::new(&path, &parameters());
    let records = reader.read_from(0)?.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(records.len(), written.len());
    for (idx, record) in records.iter().enumerate() {
        assert_eq!(record.reading, written[idx]);
        assert_eq!(record.position, offsets[idx]);
    }
    assert_eq!(records.last().map(|r| r.next), Some(writer.len()));

    // Reading again is side-effect free.
    assert_eq!(reader.read_from(0)?.count(), 25);
    Ok(())
}

#[test]
fn resume_from_cursor_sees_only_later_records() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("modbus_data.csv");
    let cursor = CursorStore::new(&dir.path().join("cursor.json"));
    let reader = ReadingLogReader::new(&path, &parameters());

    let mut writer = ReadingLogWriter::open(&path, &parameters())?;
    for seq in 0..3 {
        writer.append(&reading(seq))?;
    }
    let first = reader.read_from(cursor.load()?)?.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(first.len(), 3);
    cursor.persist(first[2].next)?;

    for seq in 3..5 {
        writer.append(&reading(seq))?;
    }
    drop(writer);

    let resumed = reader.read_from(cursor.load()?)?.collect::<Result<Vec<_>, _>>()?;
    let seen: Vec<_> = resumed.iter().map(|r| r.reading.clone()).collect();
    assert_eq!(seen, vec![reading(3), reading(4)]);
    Ok(())
}

#[test]
fn torn_tail_is_invisible_then_truncated() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("modbus_data.csv");
    let mut writer = ReadingLogWriter::open(&path, &parameters())?;
    writer.append(&reading(0))?;
    writer.append(&reading(1))?;
    let committed = writer.len();
    drop(writer);

    // Simulate a crash half way through the next append.
    OpenOptions::new()
        .append(true)
        .open(&path)?
        .write_all(b"2024-03-01T12:00:02.000Z,192.168.1.1")?;

    let reader = ReadingLogReader::new(&path, &parameters());
    assert_eq!(reader.read_from(0)?.count(), 2);

    let mut writer = ReadingLogWriter::open(&path, &parameters())?;
    assert_eq!(writer.len(), committed);
    assert_eq!(std::fs::metadata(&path)?.len(), committed);
    writer.append(&reading(2))?;

    let records = reader.read_from(0)?.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].reading, reading(2));
    Ok(())
}

#[test]
fn reopening_keeps_existing_rows() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("modbus_data.csv");
    ReadingLogWriter::open(&path, &parameters())?.append(&reading(0))?;
    let mut writer = ReadingLogWriter::open(&path, &parameters())?;
    assert!(!writer.is_empty());
    writer.append(&reading(1))?;

    let reader = ReadingLogReader::new(&path, &parameters());
    assert_eq!(reader.read_from(0)?.count(), 2);
    Ok(())
}
