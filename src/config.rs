// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-memory configuration shape (§6's table). Loading this from disk and
//! validating it beyond basic type-checking is an external collaborator's
//! job (§1); this module only defines what each field means to the pipeline
//! and what a reasonable default is.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use base::{bail, ErrorKind};

/// RTSP/RTP transport preference.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

/// Where a stream's detections come from.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum DetectionModel {
    /// A local, pluggable frame classifier, identified by a path the caller
    /// resolves to a `detection::FrameClassifier` impl. No inference runtime
    /// ships in this crate (see `detection.rs`).
    Local { path: PathBuf },
    /// An HTTP endpoint that accepts a JPEG frame and returns detections as JSON.
    Remote { url: String },
    /// ONVIF pull-point motion events, queried over HTTP/SOAP; no frame is read.
    Onvif {
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        /// Overrides the HTTP port derived from the RTSP URL (default 80);
        /// see DESIGN.md's resolution of the ONVIF-port open question.
        #[serde(default)]
        port: Option<u16>,
    },
}

fn default_segment_duration() -> u32 {
    2
}

fn default_mp4_segment_duration() -> u32 {
    900
}

fn default_detection_interval() -> u32 {
    5
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_streams() -> usize {
    16
}

fn default_confidence_threshold() -> f32 {
    0.5
}

/// A named region a detection's bounding-box center must fall within to
/// count as in-zone (§4.G). Points are normalized `[0,1]` image coordinates,
/// matching `Detection::bbox`'s coordinate space.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Zone {
    pub id: String,
    pub points: Vec<(f32, f32)>,
}

/// Immutable per-stream configuration snapshot handed to a worker at start.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Short ASCII tag identifying the stream across every component; ≤63 bytes.
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub transport: Transport,

    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u32,

    #[serde(default = "default_mp4_segment_duration")]
    pub mp4_segment_duration_secs: u32,

    pub storage_path: PathBuf,
    #[serde(default)]
    pub storage_path_hls: Option<PathBuf>,

    #[serde(default)]
    pub detection_model: Option<DetectionModel>,

    #[serde(default = "default_detection_interval")]
    pub detection_interval_secs: u32,

    #[serde(default)]
    pub pre_buffer_secs: u32,
    #[serde(default)]
    pub post_buffer_secs: u32,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default)]
    pub codec_hint: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,

    #[serde(default)]
    pub has_audio: bool,

    /// Labels that may trigger a motion recording; empty means "any label".
    #[serde(default)]
    pub detection_label_whitelist: Vec<String>,
    #[serde(default = "default_confidence_threshold")]
    pub detection_confidence_threshold: f32,
    /// Zones a detection's bbox center must fall within to trigger; empty
    /// means "anywhere in frame".
    #[serde(default)]
    pub detection_zones: Vec<Zone>,
}

impl StreamConfig {
    /// Validates the fields this crate interprets directly; doesn't attempt
    /// cross-field or filesystem validation beyond that (external concern).
    pub fn validate(&self) -> Result<(), base::Error> {
        if self.name.is_empty() || self.name.len() > 63 || !self.name.is_ascii() {
            bail!(
                ConfigInvalid,
                msg("stream name {:?} must be 1-63 ASCII bytes", self.name)
            );
        }
        if !(1..=10).contains(&self.segment_duration_secs) {
            bail!(
                ConfigInvalid,
                msg(
                    "segment_duration_secs must be 1-10, got {}",
                    self.segment_duration_secs
                )
            );
        }
        if self.mp4_segment_duration_secs > 3600 {
            bail!(
                ConfigInvalid,
                msg(
                    "mp4_segment_duration_secs must be 0-3600, got {}",
                    self.mp4_segment_duration_secs
                )
            );
        }
        Ok(())
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.segment_duration_secs))
    }

    pub fn hls_root(&self) -> &std::path::Path {
        self.storage_path_hls
            .as_deref()
            .unwrap_or(&self.storage_path)
    }
}

/// Top-level, process-wide configuration: the stream list plus global knobs.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub streams: Vec<StreamConfig>,

    /// Seconds of grace after worker start during which detection is skipped.
    #[serde(default)]
    pub startup_delay_secs: u32,

    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
}

impl Config {
    pub fn validate(&self) -> Result<(), base::Error> {
        if self.streams.len() > self.max_streams {
            bail!(
                ConfigInvalid,
                msg(
                    "{} streams configured but max_streams={}",
                    self.streams.len(),
                    self.max_streams
                )
            );
        }
        let mut names = std::collections::HashSet::new();
        for s in &self.streams {
            s.validate()?;
            if !names.insert(s.name.as_str()) {
                bail!(ConfigInvalid, msg("duplicate stream name {:?}", s.name));
            }
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self, base::Error> {
        let c: Config = toml::from_str(s).map_err(|e| {
            base::err!(ConfigInvalid, msg("parsing configuration"), source(e))
        })?;
        c.validate()?;
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            max_streams = 4

            [[streams]]
            name = "cam0"
            url = "rtsp://u:p@10.0.0.5:554/ch0"
            storage_path = "/var/lib/nvr/cam0"
        "#;
        let c = Config::from_toml_str(toml).unwrap();
        assert_eq!(c.streams.len(), 1);
        let s = &c.streams[0];
        assert_eq!(s.segment_duration_secs, 2);
        assert_eq!(s.mp4_segment_duration_secs, 900);
        assert_eq!(s.transport, Transport::Tcp);
    }

    #[test]
    fn rejects_duplicate_names() {
        let toml = r#"
            [[streams]]
            name = "cam0"
            url = "rtsp://a/b"
            storage_path = "/a"

            [[streams]]
            name = "cam0"
            url = "rtsp://c/d"
            storage_path = "/b"
        "#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn rejects_bad_segment_duration() {
        let sc = StreamConfig {
            name: "cam0".into(),
            url: "rtsp://a/b".into(),
            transport: Transport::Tcp,
            segment_duration_secs: 0,
            mp4_segment_duration_secs: 900,
            storage_path: "/a".into(),
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
            detection_confidence_threshold: default_confidence_threshold(),
            detection_zones: Vec::new(),
        };
        assert_eq!(sc.validate().unwrap_err().kind(), ErrorKind::ConfigInvalid);
    }
}
