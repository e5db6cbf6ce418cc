// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Unified Stream Worker (§4.H): the state machine that owns one stream's
//! RTSP session, HLS/MP4 writers, timestamp tracker, and detection sampler,
//! running on its own OS thread from `CONNECTING` through `STOPPED`.

use crate::config::{DetectionModel, StreamConfig};
use crate::detection::{Model, Sampler};
use crate::hls::HlsWriter;
use crate::mp4::Mp4Writer;
use crate::ports::{DetectionSink, RecordingStore, Trigger};
use crate::rtsp::{self, RtspSession};
use crate::shutdown::Coordinator;
use crate::state::{Phase, StateManager, StreamHandle};
use crate::timestamp::TimestampTracker;
use base::clock::{Clocks, RealClocks};
use base::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// §4.H: "If `now − last_packet_at > 5 s` ... → RECONNECTING".
const STALE_PACKET_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Connecting,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
}

/// Built once per worker from its `StreamConfig`; resolved here so the
/// worker's main loop never re-parses config fields.
struct ResolvedModel {
    model: Model,
}

fn resolve_model(cfg: &StreamConfig) -> Result<Option<ResolvedModel>, Error> {
    let Some(dm) = &cfg.detection_model else {
        return Ok(None);
    };
    let model = match dm {
        DetectionModel::Local { path } => {
            let _ = path; // resolved to a `FrameClassifier` by the caller; no bundled loader here.
            return Ok(None);
        }
        DetectionModel::Remote { url } => {
            let url = url::Url::parse(url).map_err(|e| {
                base::err!(ConfigInvalid, msg("parsing detection_model url"), source(e))
            })?;
            Model::Remote(url)
        }
        DetectionModel::Onvif { url, username, password, port } => {
            let url = url::Url::parse(url).map_err(|e| {
                base::err!(ConfigInvalid, msg("parsing onvif url"), source(e))
            })?;
            Model::Onvif {
                url,
                username: username.clone(),
                password: password.clone(),
                port: port.unwrap_or(80),
            }
        }
    };
    Ok(Some(ResolvedModel { model }))
}

/// One stream's runtime context. Constructed by the supervisor (§4.I), then
/// run to completion on a dedicated thread via `Worker::run`.
pub struct Worker {
    name: String,
    cfg: StreamConfig,
    rt: Handle,
    state_manager: Arc<StateManager>,
    handle: StreamHandle,
    coordinator: Arc<Coordinator>,
    store: Arc<dyn RecordingStore>,
    sink: Arc<dyn DetectionSink>,
    local_classifier: Option<Arc<dyn crate::detection::FrameClassifier>>,
    startup_delay: Duration,

    cancel: AtomicBool,
    connection_valid: AtomicBool,
    thread_exited: AtomicBool,
    attempt: AtomicU32,

    hls: Mutex<Option<Arc<HlsWriter>>>,
    mp4: Mutex<Option<Arc<Mp4Writer>>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        cfg: StreamConfig,
        rt: Handle,
        state_manager: Arc<StateManager>,
        coordinator: Arc<Coordinator>,
        store: Arc<dyn RecordingStore>,
        sink: Arc<dyn DetectionSink>,
        local_classifier: Option<Arc<dyn crate::detection::FrameClassifier>>,
        startup_delay: Duration,
    ) -> Self {
        let handle = state_manager.get_or_create(name);
        Worker {
            name: name.to_string(),
            cfg,
            rt,
            state_manager,
            handle,
            coordinator,
            store,
            sink,
            local_classifier,
            startup_delay,
            cancel: AtomicBool::new(false),
            connection_valid: AtomicBool::new(false),
            thread_exited: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            hls: Mutex::new(None),
            mp4: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// §4.H "Cooperative cancellation": set from the supervisor's `stop`.
    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        !self.thread_exited.load(Ordering::Acquire) && self.connection_valid.load(Ordering::Acquire)
    }

    pub fn thread_exited(&self) -> bool {
        self.thread_exited.load(Ordering::Acquire)
    }

    /// A reader-safe snapshot of the live HLS writer, published via a single
    /// atomic exchange (§4.H: "never a half-freed pointer") each time the
    /// writer is (re)created.
    pub fn hls_writer(&self) -> Option<Arc<HlsWriter>> {
        self.hls.lock().clone()
    }

    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
            || self.state_manager.is_stopping(&self.name)
            || !self.handle.callbacks_enabled()
            || self.coordinator.is_shutdown_initiated()
    }

    /// Runs the state machine to completion. Intended to be the body of the
    /// worker's dedicated OS thread (§5: "one dedicated OS thread per live
    /// stream").
    pub fn run(&self) {
        self.state_manager.set_phase(&self.handle, Phase::Starting);
        let mut state = WorkerState::Initializing;
        let mut tracker = TimestampTracker::new();
        let mut session: Option<RtspSession> = None;
        let mut sampler: Option<Sampler> = None;
        let mut last_packet_at = Instant::now();

        loop {
            state = match state {
                WorkerState::Initializing => WorkerState::Connecting,
                WorkerState::Connecting => {
                    if self.should_stop() {
                        WorkerState::Stopping
                    } else {
                        self.do_connect(&mut session, &mut sampler, &mut tracker, &mut last_packet_at)
                    }
                }
                WorkerState::Running => {
                    if self.should_stop() {
                        WorkerState::Stopping
                    } else {
                        self.do_run_tick(&mut session, &mut sampler, &mut tracker, &mut last_packet_at)
                    }
                }
                WorkerState::Reconnecting => {
                    if self.should_stop() {
                        WorkerState::Stopping
                    } else {
                        session = None;
                        self.connection_valid.store(false, Ordering::Release);
                        let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;
                        std::thread::sleep(rtsp::backoff(attempt));
                        self.do_connect(&mut session, &mut sampler, &mut tracker, &mut last_packet_at)
                    }
                }
                WorkerState::Stopping => {
                    self.do_stop();
                    WorkerState::Stopped
                }
                WorkerState::Stopped => break,
            };
        }
    }

    fn do_connect(
        &self,
        session: &mut Option<RtspSession>,
        sampler: &mut Option<Sampler>,
        tracker: &mut TimestampTracker,
        last_packet_at: &mut Instant,
    ) -> WorkerState {
        let url = match url::Url::parse(&self.cfg.url) {
            Ok(u) => u,
            Err(e) => {
                self.handle.set_last_error(base::err!(
                    ConfigInvalid,
                    msg("parsing stream url"),
                    source(e)
                ));
                return WorkerState::Stopping;
            }
        };

        match rtsp::probe_reachable(&url) {
            Ok(false) => {
                self.handle
                    .set_last_error(base::err!(Unreachable, msg("stream path rejected (404)")));
                let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;
                std::thread::sleep(rtsp::backoff(attempt));
                return WorkerState::Connecting;
            }
            Ok(true) => {}
            Err(e) => debug!(stream = %self.name, error = %e, "liveness probe inconclusive"),
        }

        match RtspSession::open(&self.rt, &url, self.cfg.transport) {
            Ok((s, video_params, audio_params)) => {
                tracker.reset();

                // Reconnects reuse the existing HLS/MP4 writers rather than
                // replacing them: recreating them here would reset the HLS
                // segment counter and drop the in-progress MP4 recording
                // without closing it (no trailer, no `mark_complete`). Only
                // the very first connect, when both are still `None`, opens
                // fresh ones.
                if self.hls.lock().is_none() {
                    let hls_root = self.cfg.hls_root().join(&self.name);
                    match HlsWriter::create(&hls_root, self.cfg.segment_duration()) {
                        Ok(w) => *self.hls.lock() = Some(Arc::new(w)),
                        Err(e) => {
                            self.handle.set_last_error(e);
                            let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;
                            std::thread::sleep(rtsp::backoff(attempt));
                            return WorkerState::Connecting;
                        }
                    }
                }

                if self.mp4.lock().is_none() {
                    let audio_params = if self.cfg.has_audio { audio_params } else { None };
                    let now = base::time::Time::from(RealClocks {}.realtime());
                    match Mp4Writer::open(
                        &self.cfg.storage_path,
                        &self.name,
                        Duration::from_secs(u64::from(self.cfg.mp4_segment_duration_secs)),
                        video_params,
                        audio_params,
                        self.store.clone(),
                        now,
                        Trigger::Scheduled,
                    ) {
                        Ok(w) => *self.mp4.lock() = Some(Arc::new(w)),
                        Err(e) => {
                            self.handle.set_last_error(e);
                            // HLS still serves live view even if recording can't start.
                        }
                    }
                }

                *sampler = self.build_sampler();

                *session = Some(s);
                *last_packet_at = Instant::now();
                self.attempt.store(0, Ordering::Release);
                self.connection_valid.store(true, Ordering::Release);
                self.state_manager.set_phase(&self.handle, Phase::Running);
                WorkerState::Running
            }
            Err(e) => {
                self.handle.set_last_error(e);
                let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;
                std::thread::sleep(rtsp::backoff(attempt));
                WorkerState::Connecting
            }
        }
    }

    fn build_sampler(&self) -> Option<Sampler> {
        let model = if let Some(classifier) = &self.local_classifier {
            Some(Model::Local(classifier.clone()))
        } else {
            resolve_model(&self.cfg).ok().flatten().map(|r| r.model)
        };
        model.map(|model| {
            Sampler::new(
                &self.name,
                model,
                self.sink.clone(),
                self.cfg.hls_root().to_path_buf(),
                Duration::from_secs(u64::from(self.cfg.detection_interval_secs)),
                self.startup_delay,
                Some(self.rt.clone()),
            )
        })
    }

    fn do_run_tick(
        &self,
        session: &mut Option<RtspSession>,
        sampler: &mut Option<Sampler>,
        tracker: &mut TimestampTracker,
        last_packet_at: &mut Instant,
    ) -> WorkerState {
        let Some(s) = session.as_mut() else {
            return WorkerState::Reconnecting;
        };

        match s.next_packet() {
            Ok(Some(pkt)) => {
                *last_packet_at = Instant::now();
                let out = tracker.normalize(&pkt);
                let out_pts = base::time::Time(out.out_pts);
                let out_dts = base::time::Time(out.out_dts);

                if pkt.is_video {
                    if let Some(hls) = self.hls_writer() {
                        if let Err(e) = hls.write_video(&pkt, out_pts) {
                            warn!(stream = %self.name, error = %e, "HLS write failed");
                        }
                    }
                    if let Some(mp4) = self.mp4.lock().clone() {
                        if let Err(e) = mp4.write_video(&pkt, out_pts, out_dts) {
                            warn!(stream = %self.name, error = %e, "MP4 write failed");
                        }
                    }
                } else if self.cfg.has_audio {
                    if let Some(mp4) = self.mp4.lock().clone() {
                        if let Err(e) = mp4.write_audio(&pkt, out_pts, out_dts) {
                            warn!(stream = %self.name, error = %e, "MP4 audio write failed");
                        }
                    }
                } else {
                    debug!(stream = %self.name, "dropping non-video packet: audio disabled for this stream");
                }
            }
            Ok(None) => return WorkerState::Reconnecting,
            Err(e) => {
                debug!(stream = %self.name, error = %e, "transient read error, reconnecting");
                return WorkerState::Reconnecting;
            }
        }

        if let Some(sampler) = sampler.as_ref() {
            match sampler.tick(&self.cfg) {
                Ok(outcome) if outcome.triggered => {
                    if let Some(mp4) = self.mp4.lock().clone() {
                        let now = base::time::Time::from(RealClocks {}.realtime());
                        let pre_buffer = Duration::from_secs(u64::from(self.cfg.pre_buffer_secs));
                        let post_buffer = Duration::from_secs(u64::from(self.cfg.post_buffer_secs));
                        if let Err(e) = mp4.trigger_motion(pre_buffer, post_buffer, now) {
                            warn!(stream = %self.name, error = %e, "failed to open motion recording");
                        }
                    }
                    debug!(stream = %self.name, "detection triggered a motion recording");
                }
                Ok(_) => {}
                Err(e) => warn!(stream = %self.name, error = %e, "detection tick failed"),
            }
        }

        if last_packet_at.elapsed() > STALE_PACKET_TIMEOUT {
            return WorkerState::Reconnecting;
        }

        WorkerState::Running
    }

    fn do_stop(&self) {
        self.connection_valid.store(false, Ordering::Release);
        if let Some(hls) = self.hls.lock().take() {
            if let Err(e) = hls.close() {
                warn!(stream = %self.name, error = %e, "closing HLS writer");
            }
        }
        if let Some(mp4) = self.mp4.lock().take() {
            if let Err(e) = mp4.close() {
                warn!(stream = %self.name, error = %e, "closing MP4 writer");
            }
        }
        self.state_manager.set_phase(&self.handle, Phase::Stopped);
        self.thread_exited.store(true, Ordering::Release);
        info!(stream = %self.name, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use crate::ports::testutil::{MemDetectionSink, MemRecordingStore};

    fn cfg(name: &str, url: &str) -> StreamConfig {
        StreamConfig {
            name: name.into(),
            url: url.into(),
            transport: Transport::Tcp,
            segment_duration_secs: 2,
            mp4_segment_duration_secs: 900,
            storage_path: std::env::temp_dir().join("moonfire-worker-test"),
            storage_path_hls: None,
            detection_model: None,
            detection_interval_secs: 5,
            pre_buffer_secs: 0,
            post_buffer_secs: 0,
            retention_days: 30,
            codec_hint: None,
            quality: None,
            has_audio: false,
            detection_label_whitelist: Vec::new(),
            detection_confidence_threshold: 0.5,
            detection_zones: Vec::new(),
        }
    }

    fn worker(name: &str, url: &str, rt: &Handle) -> Worker {
        Worker::new(
            name,
            cfg(name, url),
            rt.clone(),
            Arc::new(StateManager::new()),
            Arc::new(Coordinator::new()),
            Arc::new(MemRecordingStore::default()),
            Arc::new(MemDetectionSink::default()),
            None,
            Duration::ZERO,
        )
    }

    #[test]
    fn not_active_before_any_connection() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let w = worker("cam0", "rtsp://127.0.0.1:1/nope", rt.handle());
        assert!(!w.is_active());
    }

    #[test]
    fn request_stop_is_observed_by_should_stop() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let w = worker("cam0", "rtsp://127.0.0.1:1/nope", rt.handle());
        assert!(!w.should_stop());
        w.request_stop();
        assert!(w.should_stop());
    }

    #[test]
    fn stopping_with_no_writers_is_a_harmless_no_op() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let w = worker("cam0", "rtsp://127.0.0.1:1/nope", rt.handle());
        w.do_stop();
        assert!(w.thread_exited());
        assert!(!w.is_active());
    }

    #[test]
    fn malformed_url_sends_worker_straight_to_stopping() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let w = worker("cam0", "not a url", rt.handle());
        let mut session = None;
        let mut sampler = None;
        let mut tracker = TimestampTracker::new();
        let mut last_packet_at = Instant::now();
        let next = w.do_connect(&mut session, &mut sampler, &mut tracker, &mut last_packet_at);
        assert_eq!(next, WorkerState::Stopping);
        assert!(w.handle().last_error().is_some());
    }
}
