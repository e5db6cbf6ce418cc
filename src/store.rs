// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Default port adapters (§6) wiring the binary's `run` command to something
//! real: a SQLite-backed `RecordingStore` and a JSON-lines `DetectionSink`.
//! Neither is part of the live pipeline itself (§1 names the storage layer an
//! external collaborator); they're the minimum plumbing to make `moonfire-nvr
//! run` do something without a separate REST/auth process wired in front of
//! it, grounded on the teacher's own `db` crate using `rusqlite` for exactly
//! this kind of recording metadata.

use crate::ports::{Detection, DetectionSink, RecordingMeta, RecordingStore, Trigger};
use base::time::Time;
use base::{err, Error};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

fn trigger_to_str(t: Trigger) -> &'static str {
    match t {
        Trigger::Scheduled => "scheduled",
        Trigger::Motion => "motion",
        Trigger::Detection => "detection",
        Trigger::Manual => "manual",
    }
}

fn trigger_from_str(s: &str) -> Trigger {
    match s {
        "motion" => Trigger::Motion,
        "detection" => Trigger::Detection,
        "manual" => Trigger::Manual,
        _ => Trigger::Scheduled,
    }
}

/// A single-file SQLite recording metadata store (§6's `RecordingStore`
/// port). Guards its connection with a `Mutex` rather than relying on
/// SQLite's own locking, matching how little concurrent write traffic this
/// store sees (one row per segment rotation per stream).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .map_err(|e| err!(Unavailable, msg("opening recording store {}", path.display()), source(e)))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS recordings (
                id              INTEGER PRIMARY KEY,
                stream          TEXT NOT NULL,
                path            TEXT NOT NULL,
                start_time      INTEGER NOT NULL,
                planned_end_time INTEGER,
                trigger         TEXT NOT NULL,
                complete        INTEGER NOT NULL DEFAULT 0,
                end_time        INTEGER,
                size            INTEGER
            );
            CREATE INDEX IF NOT EXISTS recordings_stream_incomplete
                ON recordings (stream) WHERE complete = 0;",
        )
        .map_err(|e| err!(Unavailable, msg("creating recordings schema"), source(e)))?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }
}

impl RecordingStore for SqliteStore {
    fn add_recording(&self, meta: RecordingMeta) -> Result<u64, Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO recordings (stream, path, start_time, planned_end_time, trigger)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                meta.stream,
                meta.path.to_string_lossy(),
                meta.start_time.0,
                meta.planned_end_time.map(|t| t.0),
                trigger_to_str(meta.trigger),
            ],
        )
        .map_err(|e| err!(WriterIOError, msg("inserting recording row"), source(e)))?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn mark_complete(&self, id: u64, end_time: Time, size: u64) -> Result<(), Error> {
        self.conn
            .lock()
            .execute(
                "UPDATE recordings SET complete = 1, end_time = ?1, size = ?2 WHERE id = ?3",
                params![end_time.0, size as i64, id as i64],
            )
            .map_err(|e| err!(WriterIOError, msg("marking recording {id} complete"), source(e)))?;
        Ok(())
    }

    fn list_incomplete_for_stream(&self, name: &str) -> Result<Vec<u64>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id FROM recordings WHERE stream = ?1 AND complete = 0")
            .map_err(|e| err!(WriterIOError, msg("preparing incomplete-recordings query"), source(e)))?;
        let ids = stmt
            .query_map(params![name], |row| row.get::<_, i64>(0))
            .map_err(|e| err!(WriterIOError, msg("querying incomplete recordings"), source(e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(WriterIOError, msg("reading incomplete-recordings rows"), source(e)))?;
        Ok(ids.into_iter().map(|i| i as u64).collect())
    }

    fn get(&self, id: u64) -> Result<Option<RecordingMeta>, Error> {
        self.conn
            .lock()
            .query_row(
                "SELECT stream, path, start_time, planned_end_time, trigger
                 FROM recordings WHERE id = ?1",
                params![id as i64],
                |row| {
                    Ok(RecordingMeta {
                        stream: row.get(0)?,
                        path: PathBuf::from(row.get::<_, String>(1)?),
                        start_time: Time(row.get(2)?),
                        planned_end_time: row.get::<_, Option<i64>>(3)?.map(Time),
                        trigger: trigger_from_str(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()
            .map_err(|e| err!(WriterIOError, msg("fetching recording {id}"), source(e)))
    }
}

/// Appends one JSON object per detection tick (§6's `DetectionSink` port).
/// No tag/zone filtering here; the sink is a dumb accumulator, per §6's note
/// that filtering policy belongs to the sink, not this crate.
pub struct JsonlSink {
    file: Mutex<std::fs::File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| err!(WriterIOError, msg("opening detection sink {}", path.display()), source(e)))?;
        Ok(JsonlSink { file: Mutex::new(file) })
    }
}

#[derive(serde::Serialize)]
struct SinkRecord<'a> {
    stream: &'a str,
    timestamp: i64,
    detections: &'a [Detection],
}

impl DetectionSink for JsonlSink {
    fn append(&self, stream: &str, timestamp: Time, detections: &[Detection]) -> Result<(), Error> {
        use std::io::Write as _;
        let line = serde_json::to_string(&SinkRecord { stream, timestamp: timestamp.0, detections })
            .map_err(|e| err!(Internal, msg("serializing detection tick"), source(e)))?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")
            .map_err(|e| err!(WriterIOError, msg("appending to detection sink"), source(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Trigger;

    #[test]
    fn round_trips_a_recording_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("recordings.db")).unwrap();
        let id = store
            .add_recording(RecordingMeta {
                stream: "cam0".into(),
                path: "/rec/cam0/1.mp4".into(),
                start_time: Time(0),
                planned_end_time: None,
                trigger: Trigger::Scheduled,
            })
            .unwrap();
        assert_eq!(store.list_incomplete_for_stream("cam0").unwrap(), vec![id]);
        store.mark_complete(id, Time(90_000), 4096).unwrap();
        assert!(store.list_incomplete_for_stream("cam0").unwrap().is_empty());
        let got = store.get(id).unwrap().unwrap();
        assert_eq!(got.stream, "cam0");
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.jsonl");
        let sink = JsonlSink::open(&path).unwrap();
        sink.append("cam0", Time(0), &[]).unwrap();
        sink.append("cam0", Time(90_000), &[]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
