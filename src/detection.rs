// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Detection Sampler (§4.G): runs alongside the live writers, outside their
//! hot path, polling a pluggable model at a configured interval and handing
//! results to an injected sink. A single-flight `detection_in_progress` flag
//! with a stuck-detection timeout keeps one slow model call from starving
//! subsequent ticks.

use crate::config::{StreamConfig, Zone};
use crate::ports::{Detection, DetectionSink};
use base::clock::{Clocks, RealClocks};
use base::time::Time;
use base::{err, Error};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::warn;
use url::Url;

fn now() -> Time {
    Time::from(RealClocks {}.realtime())
}

/// A sampler never lets a detection run longer than this before force-
/// releasing the single-flight flag and logging (§4.G "stuck detection").
const STUCK_TIMEOUT: Duration = Duration::from_secs(60);

const ONVIF_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// A pluggable local frame classifier. This crate defines the seam; no
/// inference runtime is bundled (no example in this corpus's dependency
/// stack ships one).
pub trait FrameClassifier: Send + Sync {
    fn classify(&self, segment: &Path) -> Result<Vec<Detection>, Error>;
}

/// Where a stream's detections come from (§4.G's capability set), all
/// exposed through the sampler's single `detect` call.
pub enum Model {
    Local(Arc<dyn FrameClassifier>),
    Remote(Url),
    Onvif {
        url: Url,
        username: Option<String>,
        password: Option<String>,
        port: u16,
    },
}

/// Outcome of one `tick()` call, for the worker to log or act on.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub ran: bool,
    pub detections: Vec<Detection>,
    /// True if any detection in this tick passed the whitelist/threshold/
    /// zone check and should open or extend a motion recording (§4.F).
    pub triggered: bool,
}

struct SegmentScan {
    path: PathBuf,
    index: u64,
}

/// One sampler per stream, ticked (~1Hz) from the worker's packet loop.
pub struct Sampler {
    stream: String,
    model: Model,
    sink: Arc<dyn DetectionSink>,
    hls_root: PathBuf,
    detection_interval: Duration,
    startup_deadline: Instant,
    rt: Option<Handle>,
    http: Option<reqwest::Client>,

    in_progress: AtomicBool,
    in_progress_since: Mutex<Option<Instant>>,
    last_detection_at: Mutex<Option<Instant>>,
    last_segment_index: Mutex<Option<u64>>,
}

impl Sampler {
    pub fn new(
        stream: &str,
        model: Model,
        sink: Arc<dyn DetectionSink>,
        hls_root: PathBuf,
        detection_interval: Duration,
        startup_delay: Duration,
        rt: Option<Handle>,
    ) -> Self {
        let http = match &model {
            Model::Remote(_) | Model::Onvif { .. } => Some(
                reqwest::Client::builder()
                    .timeout(ONVIF_HTTP_TIMEOUT)
                    .build()
                    .expect("building reqwest client"),
            ),
            Model::Local(_) => None,
        };
        Sampler {
            stream: stream.to_string(),
            model,
            sink,
            hls_root,
            detection_interval,
            startup_deadline: Instant::now() + startup_delay,
            rt,
            http,
            in_progress: AtomicBool::new(false),
            in_progress_since: Mutex::new(None),
            last_detection_at: Mutex::new(None),
            last_segment_index: Mutex::new(None),
        }
    }

    /// Drives one iteration of the state machine in §4.G:
    /// `IDLE -> (due?) -> CLAIM -> RUN -> PUBLISH -> RELEASE -> IDLE`, with
    /// `any state -> STUCK_TIMEOUT -> RELEASE -> IDLE` checked first.
    pub fn tick(&self, cfg: &StreamConfig) -> Result<TickOutcome, Error> {
        self.check_stuck();

        if Instant::now() < self.startup_deadline {
            return Ok(TickOutcome::default());
        }
        let due = self
            .last_detection_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed() >= self.detection_interval)
            .unwrap_or(true);
        if !due {
            return Ok(TickOutcome::default());
        }

        // CLAIM: atomic 0 -> 1.
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(TickOutcome::default());
        }
        *self.in_progress_since.lock().unwrap() = Some(Instant::now());

        let result = self.run_and_publish(cfg);

        // RELEASE.
        *self.last_detection_at.lock().unwrap() = Some(Instant::now());
        *self.in_progress_since.lock().unwrap() = None;
        self.in_progress.store(false, Ordering::Release);

        result
    }

    fn check_stuck(&self) {
        let stuck = self
            .in_progress_since
            .lock()
            .unwrap()
            .map(|since| since.elapsed() >= STUCK_TIMEOUT)
            .unwrap_or(false);
        if stuck {
            warn!(stream = %self.stream, "detection stuck past {:?}, force-releasing", STUCK_TIMEOUT);
            *self.in_progress_since.lock().unwrap() = None;
            self.in_progress.store(false, Ordering::Release);
        }
    }

    fn run_and_publish(&self, cfg: &StreamConfig) -> Result<TickOutcome, Error> {
        let detections = match &self.model {
            Model::Onvif { url, username, password, port } => {
                self.poll_onvif(url, username.as_deref(), password.as_deref(), *port)?
            }
            Model::Local(classifier) => match self.find_newest_segment()? {
                Some(scan) => {
                    let d = classifier.classify(&scan.path)?;
                    *self.last_segment_index.lock().unwrap() = Some(scan.index);
                    d
                }
                None => return Ok(TickOutcome::default()),
            },
            Model::Remote(url) => match self.find_newest_segment()? {
                Some(scan) => {
                    let d = self.post_remote(url, &scan.path)?;
                    *self.last_segment_index.lock().unwrap() = Some(scan.index);
                    d
                }
                None => return Ok(TickOutcome::default()),
            },
        };

        self.sink.append(&self.stream, now(), &detections)?;

        let triggered = detections.iter().any(|d| detection_triggers_recording(cfg, d));
        Ok(TickOutcome { ran: true, detections, triggered })
    }

    /// Locates the newest finished HLS segment (§4.G): the canonical path
    /// first, falling back to the legacy nested `hls/hls/<stream>/` layout
    /// for read only (§6, §9's resolved open question). Returns `Ok(None)`
    /// if no segment is newer than the last one processed, or if it
    /// vanished between scan and stat.
    fn find_newest_segment(&self) -> Result<Option<SegmentScan>, Error> {
        let candidates = [
            self.hls_root.join(&self.stream),
            self.hls_root.join("hls").join(&self.stream),
        ];

        let mut best: Option<SegmentScan> = None;
        for dir in &candidates {
            let entries = match std::fs::read_dir(dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                let Some(index) = parse_segment_index(name) else { continue };
                if best.as_ref().map(|b| index > b.index).unwrap_or(true) {
                    best = Some(SegmentScan { path: entry.path(), index });
                }
            }
        }

        let last = *self.last_segment_index.lock().unwrap();
        match best {
            Some(scan) if last.map(|l| scan.index > l).unwrap_or(true) => {
                if !scan.path.exists() {
                    return Ok(None);
                }
                Ok(Some(scan))
            }
            _ => Ok(None),
        }
    }

    fn post_remote(&self, url: &Url, segment: &Path) -> Result<Vec<Detection>, Error> {
        let bytes = std::fs::read(segment)
            .map_err(|e| err!(DetectionModelLoadError, msg("reading segment {segment:?}"), source(e)))?;
        let http = self.http.as_ref().expect("Remote model always has a client");
        let rt = self.rt.as_ref().expect("Remote model always has a runtime handle");
        let resp = rt
            .block_on(http.post(url.clone()).body(bytes).send())
            .map_err(|e| err!(Unreachable, msg("posting segment to detection endpoint"), source(e)))?;
        let detections: Vec<Detection> = rt
            .block_on(resp.json())
            .map_err(|e| err!(Unreachable, msg("parsing detection response"), source(e)))?;
        Ok(detections)
    }

    /// Queries camera motion state over ONVIF's `GetEventProperties`/pull-
    /// point SOAP interface (§4.G, §6). No frame is read for this model.
    fn poll_onvif(
        &self,
        url: &Url,
        username: Option<&str>,
        password: Option<&str>,
        port: u16,
    ) -> Result<Vec<Detection>, Error> {
        let mut endpoint = url.clone();
        let _ = endpoint.set_port(Some(port));

        let body = onvif_pull_point_envelope();
        let http = self.http.as_ref().expect("Onvif model always has a client");
        let rt = self.rt.as_ref().expect("Onvif model always has a runtime handle");

        let mut req = http
            .post(endpoint)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .body(body);
        if let Some(user) = username {
            req = req.basic_auth(user, password);
        }

        let text = rt
            .block_on(async {
                let resp = req.send().await?;
                resp.text().await
            })
            .map_err(|e| err!(Unreachable, msg("ONVIF request failed"), source(e)))?;

        Ok(parse_onvif_motion_response(&text, &self.stream))
    }
}

/// A minimal `PullMessages` SOAP envelope; enough to elicit a motion-tagged
/// `NotificationMessage` from cameras exposing the pull-point event service.
fn onvif_pull_point_envelope() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Body>
    <PullMessages xmlns="http://www.onvif.org/ver10/events/wsdl">
      <Timeout>PT1S</Timeout>
      <MessageLimit>10</MessageLimit>
    </PullMessages>
  </s:Body>
</s:Envelope>"#
        .to_string()
}

/// Parses a `PullMessagesResponse` for `IsMotion` / `State` simple items,
/// yielding one `Detection` per `true` motion notification.
fn parse_onvif_motion_response(xml: &str, stream: &str) -> Vec<Detection> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut detections = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"SimpleItem" => {
                let attr = |key: &[u8]| {
                    e.attributes()
                        .flatten()
                        .find(|a| a.key.local_name().as_ref() == key)
                        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
                };
                let name = attr(b"Name");
                let value = attr(b"Value");
                if matches!(name.as_deref(), Some("IsMotion") | Some("State"))
                    && matches!(value.as_deref(), Some("true") | Some("1"))
                {
                    detections.push(onvif_detection(stream));
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    detections
}

fn onvif_detection(_stream: &str) -> Detection {
    Detection {
        label: "motion".to_string(),
        confidence: 1.0,
        bbox: (0.0, 0.0, 1.0, 1.0),
        track_id: None,
        zone_id: None,
        timestamp: now(),
    }
}

fn parse_segment_index(name: &str) -> Option<u64> {
    let stem = name.strip_prefix("seg-")?.strip_suffix(".ts").or_else(|| name.strip_prefix("seg-")?.strip_suffix(".m4s"))?;
    stem.parse().ok()
}

/// §4.G: a detection triggers a motion recording only if its label is
/// whitelisted (or the whitelist is empty), its confidence clears the
/// configured threshold, and (if any zones are configured) its bounding-box
/// center falls inside at least one of them.
pub fn detection_triggers_recording(cfg: &StreamConfig, d: &Detection) -> bool {
    if !cfg.detection_label_whitelist.is_empty()
        && !cfg.detection_label_whitelist.iter().any(|l| l == &d.label)
    {
        return false;
    }
    if d.confidence < cfg.detection_confidence_threshold {
        return false;
    }
    if cfg.detection_zones.is_empty() {
        return true;
    }
    let center = (d.bbox.0 + d.bbox.2 / 2.0, d.bbox.1 + d.bbox.3 / 2.0);
    cfg.detection_zones.iter().any(|z| point_in_polygon(center, &z.points))
}

/// Standard ray-casting point-in-polygon test.
fn point_in_polygon(point: (f32, f32), polygon: &[(f32, f32)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let (x, y) = point;
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > y) != (yj > y) {
            let x_intersect = xj + (y - yj) / (yi - yj) * (xi - xj);
            if x < x_intersect {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::testutil::MemDetectionSink;

    fn cfg_with(whitelist: Vec<&str>, threshold: f32, zones: Vec<Zone>) -> StreamConfig {
        StreamConfig {
            name: "cam0".into(),
            url: "rtsp://a/b".into(),
            transport: crate::config::Transport::Tcp,
            segment_duration_secs: 2,
            mp4_segment_duration_secs: 900,
            storage_path: "/tmp".into(),
            storage_path_hls: None,
            detection_model: None,
            detection_interval_secs: 5,
            pre_buffer_secs: 0,
            post_buffer_secs: 0,
            retention_days: 30,
            codec_hint: None,
            quality: None,
            has_audio: false,
            detection_label_whitelist: whitelist.into_iter().map(String::from).collect(),
            detection_confidence_threshold: threshold,
            detection_zones: zones,
        }
    }

    fn detection(label: &str, confidence: f32, bbox: (f32, f32, f32, f32)) -> Detection {
        Detection {
            label: label.to_string(),
            confidence,
            bbox,
            track_id: None,
            zone_id: None,
            timestamp: Time(0),
        }
    }

    #[test]
    fn empty_whitelist_allows_any_label() {
        let cfg = cfg_with(vec![], 0.5, vec![]);
        assert!(detection_triggers_recording(&cfg, &detection("person", 0.9, (0.0, 0.0, 0.1, 0.1))));
    }

    #[test]
    fn whitelist_rejects_unlisted_label() {
        let cfg = cfg_with(vec!["person"], 0.5, vec![]);
        assert!(!detection_triggers_recording(&cfg, &detection("cat", 0.9, (0.0, 0.0, 0.1, 0.1))));
    }

    #[test]
    fn below_threshold_does_not_trigger() {
        let cfg = cfg_with(vec![], 0.8, vec![]);
        assert!(!detection_triggers_recording(&cfg, &detection("person", 0.5, (0.0, 0.0, 0.1, 0.1))));
    }

    #[test]
    fn zone_filter_requires_center_inside_polygon() {
        let zone = Zone {
            id: "driveway".into(),
            points: vec![(0.0, 0.0), (0.5, 0.0), (0.5, 0.5), (0.0, 0.5)],
        };
        let cfg = cfg_with(vec![], 0.0, vec![zone]);
        let inside = detection("person", 1.0, (0.1, 0.1, 0.1, 0.1)); // center (0.15, 0.15)
        let outside = detection("person", 1.0, (0.8, 0.8, 0.1, 0.1)); // center (0.85, 0.85)
        assert!(detection_triggers_recording(&cfg, &inside));
        assert!(!detection_triggers_recording(&cfg, &outside));
    }

    #[test]
    fn empty_detection_tick_still_reaches_sink() {
        let sink = Arc::new(MemDetectionSink::default());
        sink.append("cam0", Time(0), &[]).unwrap();
        assert_eq!(sink.appended.lock().unwrap().len(), 1);
    }

    #[test]
    fn stuck_in_progress_is_force_released() {
        let sampler = Sampler::new(
            "cam0",
            Model::Local(Arc::new(NeverClassifier)),
            Arc::new(MemDetectionSink::default()),
            PathBuf::from("/nonexistent"),
            Duration::from_secs(5),
            Duration::ZERO,
            None,
        );
        sampler.in_progress.store(true, Ordering::Release);
        *sampler.in_progress_since.lock().unwrap() = Some(Instant::now() - Duration::from_secs(61));
        sampler.check_stuck();
        assert!(!sampler.in_progress.load(Ordering::Acquire));
    }

    struct NeverClassifier;
    impl FrameClassifier for NeverClassifier {
        fn classify(&self, _segment: &Path) -> Result<Vec<Detection>, Error> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn parses_segment_index_from_filename() {
        assert_eq!(parse_segment_index("seg-0000000042.ts"), Some(42));
        assert_eq!(parse_segment_index(".seg-0000000042.ts"), None);
        assert_eq!(parse_segment_index("index.m3u8"), None);
    }
}
