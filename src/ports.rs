// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Injected persistence ports (§6): the recording metadata store and the
//! detection result sink. Neither is implemented here — both are supplied by
//! an external collaborator (the auth/REST/storage layer named out of scope
//! in §1) — this module only defines the trait seam and the value types
//! carried across it.

use base::time::Time;

/// Why a recording was opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Motion,
    Detection,
    Manual,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RecordingMeta {
    pub stream: String,
    pub path: std::path::PathBuf,
    pub start_time: Time,
    pub planned_end_time: Option<Time>,
    pub trigger: Trigger,
}

/// Persists recording metadata. Implementations MUST make `add_recording`
/// and `mark_complete` idempotent: a crash between a data write and its
/// metadata update must never be observable as more than one dangling
/// `complete=false` record per stream (§4.F, §7).
pub trait RecordingStore: Send + Sync {
    fn add_recording(&self, meta: RecordingMeta) -> Result<u64, base::Error>;

    fn mark_complete(&self, id: u64, end_time: Time, size: u64) -> Result<(), base::Error>;

    fn list_incomplete_for_stream(&self, name: &str) -> Result<Vec<u64>, base::Error>;

    fn get(&self, id: u64) -> Result<Option<RecordingMeta>, base::Error>;
}

/// One detection within a tick's results (§3's `DetectionResult`).
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// Normalized `[0,1]` bounding box: (x, y, w, h).
    pub bbox: (f32, f32, f32, f32),
    pub track_id: Option<u64>,
    pub zone_id: Option<String>,
    pub timestamp: Time,
}

/// Accepts detection ticks, including empty ones (a tick with zero
/// detections still records liveness). The sink owns its own label/zone
/// filtering policy; this crate applies only the whitelist/threshold check
/// needed to decide whether to trigger a motion recording (§4.G).
pub trait DetectionSink: Send + Sync {
    fn append(&self, stream: &str, timestamp: Time, detections: &[Detection]) -> Result<(), base::Error>;
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::sync::Mutex;

    /// In-memory store/sink for worker and writer tests; not used in production.
    #[derive(Default)]
    pub struct MemRecordingStore {
        next_id: Mutex<u64>,
        records: Mutex<std::collections::HashMap<u64, (RecordingMeta, bool, Option<Time>, Option<u64>)>>,
    }

    impl RecordingStore for MemRecordingStore {
        fn add_recording(&self, meta: RecordingMeta) -> Result<u64, base::Error> {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            self.records
                .lock()
                .unwrap()
                .insert(id, (meta, false, None, None));
            Ok(id)
        }

        fn mark_complete(&self, id: u64, end_time: Time, size: u64) -> Result<(), base::Error> {
            let mut records = self.records.lock().unwrap();
            if let Some(entry) = records.get_mut(&id) {
                entry.1 = true;
                entry.2 = Some(end_time);
                entry.3 = Some(size);
            }
            Ok(())
        }

        fn list_incomplete_for_stream(&self, name: &str) -> Result<Vec<u64>, base::Error> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, (m, complete, _, _))| m.stream == name && !complete)
                .map(|(id, _)| *id)
                .collect())
        }

        fn get(&self, id: u64) -> Result<Option<RecordingMeta>, base::Error> {
            Ok(self.records.lock().unwrap().get(&id).map(|(m, ..)| m.clone()))
        }
    }

    #[derive(Default)]
    pub struct MemDetectionSink {
        pub appended: Mutex<Vec<(String, Time, Vec<Detection>)>>,
    }

    impl DetectionSink for MemDetectionSink {
        fn append(&self, stream: &str, timestamp: Time, detections: &[Detection]) -> Result<(), base::Error> {
            self.appended
                .lock()
                .unwrap()
                .push((stream.to_string(), timestamp, detections.to_vec()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn mark_complete_is_idempotent() {
        let store = MemRecordingStore::default();
        let id = store
            .add_recording(RecordingMeta {
                stream: "cam0".into(),
                path: "/x".into(),
                start_time: Time(0),
                planned_end_time: None,
                trigger: Trigger::Scheduled,
            })
            .unwrap();
        store.mark_complete(id, Time(90_000), 1024).unwrap();
        store.mark_complete(id, Time(90_000), 1024).unwrap();
        assert_eq!(store.list_incomplete_for_stream("cam0").unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn empty_detection_tick_is_recorded() {
        let sink = MemDetectionSink::default();
        sink.append("cam0", Time(0), &[]).unwrap();
        assert_eq!(sink.appended.lock().unwrap().len(), 1);
    }
}
