// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MP4 Writer (§4.F): rotating ISO/IEC 14496-12 files written with `moov`
//! before `mdat` ("faststart"), so a recording is playable before the next
//! rotation closes it. Boxes are built by hand (length-prefixed, big-endian),
//! the same way this corpus's own `.mp4` serving code builds its box tree,
//! rather than through a general-purpose muxing crate.

use crate::packet::Packet;
use crate::ports::{RecordingMeta, RecordingStore, Trigger};
use crate::rtsp::VideoParameters;
use crate::timestamp::synth_audio_dts;
use base::time::Time;
use base::{bail, err, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Every `Time`/`Packet` timestamp this writer sees is already normalized
/// into 90kHz units by the timestamp tracker (§4.C, §2.A), so a single
/// timescale serves both the `mvhd` and every track's `mdhd`.
const TIMESCALE: u32 = 90_000;

/// Seconds between the Unix epoch and the ISO-14496 (1904-01-01) epoch.
fn to_iso14496_timestamp(unix_secs: i64) -> u32 {
    (unix_secs + 24107 * 86400) as u32
}

#[derive(Clone, Copy)]
struct SampleRecord {
    offset: u64,
    size: u32,
    duration: u32,
    is_sync: bool,
}

struct TrackBuilder {
    samples: Vec<SampleRecord>,
    last_dts: Option<i64>,
}

impl TrackBuilder {
    fn new() -> Self {
        TrackBuilder { samples: Vec::new(), last_dts: None }
    }

    fn total_duration(&self) -> u64 {
        self.samples.iter().map(|s| u64::from(s.duration)).sum()
    }

    /// The last sample's duration is never patched by a successor (there
    /// isn't one); give it the same duration as the sample before it rather
    /// than leave the placeholder `1` in the written `stts`.
    fn finish(&mut self) {
        if self.samples.len() >= 2 {
            let prev_duration = self.samples[self.samples.len() - 2].duration;
            self.samples.last_mut().unwrap().duration = prev_duration;
        }
    }

    /// Appends a sample. A sample's `stts` duration is the gap to the *next*
    /// sample's dts, so it isn't known until that next sample arrives; this
    /// back-patches the previous entry's duration once the new dts lands,
    /// and gives the newly pushed entry a provisional duration of 1 (patched
    /// in turn when its successor arrives, or left as-is if it's the last
    /// sample in the segment). The tracker (§4.C) guarantees dts is strictly
    /// monotonic, so the patched value is always `>= 1` after the clamp.
    fn push(&mut self, offset: u64, size: u32, dts: i64, is_sync: bool) {
        if let Some(prev) = self.last_dts {
            let duration = (dts - prev).max(1) as u32;
            self.samples.last_mut().expect("last_dts implies a prior sample").duration = duration;
        }
        self.last_dts = Some(dts);
        self.samples.push(SampleRecord { offset, size, duration: 1, is_sync });
    }
}

pub struct AudioParameters {
    pub sample_rate: u32,
    pub channels: u16,
    /// Codec-specific config (e.g. an AAC `AudioSpecificConfig`), carried
    /// opaquely into the `esds` decoder-specific-info field.
    pub extra_data: Bytes,
}

struct OpenFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    mdat: Vec<u8>,
    video: TrackBuilder,
    audio: Option<TrackBuilder>,
    video_params: VideoParameters,
    audio_params: Option<AudioParameters>,
    start_time: Time,
    last_video_rotation_check: std::time::Instant,
    last_audio_dts: Option<i64>,
    recording_id: u64,
    trigger: Trigger,
    /// Set while a motion trigger's post-buffer window is open (§4.F/§4.G);
    /// the scheduled-duration rotation in `write_video` is deferred until it
    /// elapses, so the motion-tagged file keeps recording through the
    /// configured post-buffer instead of being cut off mid-event.
    motion_deadline: Option<std::time::Instant>,
}

struct Inner {
    store: Arc<dyn RecordingStore>,
    stream: String,
    rec_root: PathBuf,
    segment_duration: Duration,
    current: Option<OpenFile>,
    ended: bool,
}

/// One stream's rotating MP4 recordings. Like `HlsWriter`, owns no thread;
/// the worker calls `write_video`/`write_audio` inline and `close` at
/// shutdown.
pub struct Mp4Writer {
    inner: Mutex<Inner>,
}

impl Mp4Writer {
    pub fn open(
        rec_root: &Path,
        stream: &str,
        segment_duration: Duration,
        video_params: VideoParameters,
        audio_params: Option<AudioParameters>,
        store: Arc<dyn RecordingStore>,
        start_time: Time,
        trigger: Trigger,
    ) -> Result<Self, Error> {
        let mut inner = Inner {
            store,
            stream: stream.to_string(),
            rec_root: rec_root.to_path_buf(),
            segment_duration,
            current: None,
            ended: false,
        };
        inner.open_segment(video_params, audio_params, start_time, trigger)?;
        Ok(Mp4Writer { inner: Mutex::new(inner) })
    }

    pub fn write_video(&self, pkt: &Packet, out_pts: Time, out_dts: Time) -> Result<(), Error> {
        if !pkt.is_video {
            bail!(Bug, msg("write_video called with a non-video packet"));
        }
        let mut inner = self.inner.lock();
        if inner.ended {
            return Ok(());
        }

        let should_rotate = inner.segment_duration > Duration::ZERO
            && pkt.is_keyframe
            && inner
                .current
                .as_ref()
                .map(|c| {
                    c.last_video_rotation_check.elapsed() >= inner.segment_duration
                        && c.motion_deadline
                            .map(|d| std::time::Instant::now() >= d)
                            .unwrap_or(true)
                })
                .unwrap_or(false);
        if should_rotate {
            inner.rotate(out_pts, Trigger::Scheduled)?;
        }

        let Some(cur) = inner.current.as_mut() else {
            return Ok(());
        };
        cur.push_sample(true, &pkt.payload, out_dts.0, out_pts.0, pkt.is_keyframe);
        Ok(())
    }

    pub fn write_audio(&self, pkt: &Packet, out_pts: Time, out_dts: Time) -> Result<(), Error> {
        if pkt.is_video {
            bail!(Bug, msg("write_audio called with a video packet"));
        }
        let mut inner = self.inner.lock();
        if inner.ended {
            return Ok(());
        }
        let Some(cur) = inner.current.as_mut() else {
            return Ok(());
        };
        if cur.audio.is_none() {
            debug!("dropping audio packet: stream has no audio track");
            return Ok(());
        }
        let dts = match pkt.dts {
            Some(_) => out_dts.0,
            None => {
                let sample_rate = cur.audio_params.as_ref().map(|a| a.sample_rate).unwrap_or(48_000);
                let last = cur.last_audio_dts.unwrap_or(0);
                synth_audio_dts(last, 1, sample_rate)
            }
        };
        let pts = out_pts.0.max(dts);
        cur.last_audio_dts = Some(dts);
        cur.push_sample(false, &pkt.payload, dts, pts, true);
        Ok(())
    }

    /// §4.G: called when the detection sampler reports a trigger. If the
    /// current file isn't already motion-tagged, rotates into a fresh one
    /// tagged `Trigger::Motion` whose recorded `start_time` is backdated by
    /// `pre_buffer`: segments are written back to back with no gap, so the
    /// file that was just closed already holds that pre-buffer footage.
    /// Either way, pushes the post-buffer deadline that defers the next
    /// scheduled-duration rotation so the event isn't cut short.
    pub fn trigger_motion(&self, pre_buffer: Duration, post_buffer: Duration, now: Time) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.ended {
            return Ok(());
        }
        let deadline = std::time::Instant::now() + post_buffer;
        let already_motion = inner.current.as_ref().map(|c| c.trigger == Trigger::Motion).unwrap_or(false);
        if already_motion {
            if let Some(cur) = inner.current.as_mut() {
                cur.motion_deadline = Some(cur.motion_deadline.map(|d| d.max(deadline)).unwrap_or(deadline));
            }
            return Ok(());
        }
        let pre_buffer_ticks = pre_buffer.as_secs() as i64 * base::time::TIME_UNITS_PER_SEC;
        let start = Time((now.0 - pre_buffer_ticks).max(0));
        inner.rotate(start, Trigger::Motion)?;
        if let Some(cur) = inner.current.as_mut() {
            cur.motion_deadline = Some(deadline);
        }
        Ok(())
    }

    /// Closes the current file gracefully (writes the trailer, marks the
    /// recording complete). An ungraceful stop (process just exits) leaves
    /// the last file's recording row `complete=false`, to be reconciled by
    /// the supervisor's `list_incomplete_for_stream` scan on next startup.
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.ended {
            return Ok(());
        }
        if let Some(cur) = inner.current.take() {
            inner.finalize(cur)?;
        }
        inner.ended = true;
        Ok(())
    }

    pub fn recording_id(&self) -> Option<u64> {
        self.inner.lock().current.as_ref().map(|c| c.recording_id)
    }
}

impl OpenFile {
    fn push_sample(&mut self, is_video: bool, payload: &[u8], dts: i64, pts: i64, is_sync: bool) {
        let offset = self.mdat.len() as u64;
        self.mdat.extend_from_slice(payload);
        let track = if is_video {
            &mut self.video
        } else {
            self.audio.as_mut().expect("checked by caller")
        };
        // pts is implied equal to dts once normalized (§4.C): no separate ctts table.
        let _ = pts;
        track.push(offset, payload.len() as u32, dts, is_sync);
    }
}

impl Inner {
    fn open_segment(
        &mut self,
        video_params: VideoParameters,
        audio_params: Option<AudioParameters>,
        start_time: Time,
        trigger: Trigger,
    ) -> Result<(), Error> {
        let dir = self.rec_root.join(&self.stream).join(start_dir_suffix(start_time));
        std::fs::create_dir_all(&dir)
            .map_err(|e| err!(WriterIOError, msg("creating recording directory {dir:?}"), source(e)))?;
        let final_path = dir.join(format!("{}.mp4", start_time.0 / base::time::TIME_UNITS_PER_SEC));
        let tmp_path = dir.join(format!(".{}.mp4.tmp", start_time.0 / base::time::TIME_UNITS_PER_SEC));

        let recording_id = self.store.add_recording(RecordingMeta {
            stream: self.stream.clone(),
            path: final_path.clone(),
            start_time,
            planned_end_time: None,
            trigger,
        })?;

        self.current = Some(OpenFile {
            tmp_path,
            final_path,
            mdat: Vec::new(),
            video: TrackBuilder::new(),
            audio: audio_params.as_ref().map(|_| TrackBuilder::new()),
            video_params,
            audio_params,
            start_time,
            last_video_rotation_check: std::time::Instant::now(),
            last_audio_dts: None,
            recording_id,
            trigger,
            motion_deadline: None,
        });
        Ok(())
    }

    fn rotate(&mut self, next_start: Time, trigger: Trigger) -> Result<(), Error> {
        let Some(cur) = self.current.take() else {
            return Ok(());
        };
        let video_params = cur.video_params.clone_for_rotation();
        let audio_params = cur.audio_params.as_ref().map(AudioParameters::clone_for_rotation);
        self.finalize(cur)?;
        self.open_segment(video_params, audio_params, next_start, trigger)
    }

    fn finalize(&mut self, mut cur: OpenFile) -> Result<(), Error> {
        if cur.video.samples.is_empty() {
            // Nothing was ever written; drop the empty recording rather than
            // leave a zero-length dangling file.
            let _ = std::fs::remove_file(&cur.tmp_path);
            return Ok(());
        }
        cur.video.finish();
        if let Some(audio) = cur.audio.as_mut() {
            audio.finish();
        }

        let file_bytes = build_file(&cur)?;
        {
            let mut f = std::fs::File::create(&cur.tmp_path)
                .map_err(|e| err!(WriterIOError, msg("creating mp4 {:?}", cur.tmp_path), source(e)))?;
            f.write_all(&file_bytes)
                .map_err(|e| err!(WriterIOError, msg("writing mp4 {:?}", cur.tmp_path), source(e)))?;
            f.sync_all()
                .map_err(|e| err!(WriterIOError, msg("flushing mp4 {:?}", cur.tmp_path), source(e)))?;
        }
        std::fs::rename(&cur.tmp_path, &cur.final_path).map_err(|e| {
            err!(
                WriterIOError,
                msg("renaming mp4 {:?} -> {:?}", cur.tmp_path, cur.final_path),
                source(e)
            )
        })?;

        let size = file_bytes.len() as u64;
        let duration_ticks = cur.video.total_duration();
        let end_time = Time(cur.start_time.0 + duration_ticks as i64);
        self.store.mark_complete(cur.recording_id, end_time, size)?;
        Ok(())
    }
}

impl VideoParameters {
    fn clone_for_rotation(&self) -> Self {
        VideoParameters {
            width: self.width,
            height: self.height,
            extra_data: self.extra_data.clone(),
        }
    }
}

impl AudioParameters {
    fn clone_for_rotation(&self) -> Self {
        AudioParameters {
            sample_rate: self.sample_rate,
            channels: self.channels,
            extra_data: self.extra_data.clone(),
        }
    }
}

fn start_dir_suffix(t: Time) -> String {
    let unix_secs = t.0 / base::time::TIME_UNITS_PER_SEC;
    let days = unix_secs.div_euclid(86_400);
    // Proleptic Gregorian calendar date from a day count; matches the
    // YYYY/MM/DD layout in §6 without pulling in a full calendar dependency
    // for this one path component (display formatting elsewhere uses `jiff`).
    let (y, m, d) = civil_from_days(days);
    format!("{y:04}/{m:02}/{d:02}")
}

/// Howard Hinnant's `civil_from_days`, the standard constant-time algorithm
/// for converting a day count (since 1970-01-01) into a Gregorian date.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn write_box(buf: &mut Vec<u8>, fourcc: &[u8; 4], f: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.write_u32::<BigEndian>(0).unwrap();
    buf.extend_from_slice(fourcc);
    f(buf);
    let len = (buf.len() - start) as u32;
    BigEndian::write_u32(&mut buf[start..start + 4], len);
}

fn build_file(cur: &OpenFile) -> Result<Vec<u8>, Error> {
    let mut ftyp = Vec::new();
    write_box(&mut ftyp, b"ftyp", |b| {
        b.extend_from_slice(b"isom");
        b.write_u32::<BigEndian>(0x200).unwrap();
        b.extend_from_slice(b"isomiso2avc1mp41");
    });

    let mut moov = Vec::new();
    let mut co64_patches = Vec::new();
    let creation_ts = to_iso14496_timestamp(cur.start_time.0 / base::time::TIME_UNITS_PER_SEC);
    write_box(&mut moov, b"moov", |moov| {
        write_mvhd(moov, creation_ts, cur.video.total_duration(), next_track_id(cur));
        write_video_trak(moov, cur, creation_ts, &mut co64_patches);
        if let (Some(audio), Some(params)) = (&cur.audio, &cur.audio_params) {
            write_audio_trak(moov, audio, params, creation_ts, &mut co64_patches);
        }
    });

    let mdat_offset = (ftyp.len() + moov.len() + 8) as u64;
    for (pos, rel_offset) in &co64_patches {
        BigEndian::write_u64(&mut moov[*pos..*pos + 8], mdat_offset + rel_offset);
    }

    let mut out = Vec::with_capacity(ftyp.len() + moov.len() + 8 + cur.mdat.len());
    out.extend_from_slice(&ftyp);
    out.extend_from_slice(&moov);
    out.write_u32::<BigEndian>((cur.mdat.len() + 8) as u32).unwrap();
    out.extend_from_slice(b"mdat");
    out.extend_from_slice(&cur.mdat);
    Ok(out)
}

fn next_track_id(cur: &OpenFile) -> u32 {
    if cur.audio.is_some() {
        3
    } else {
        2
    }
}

fn write_mvhd(buf: &mut Vec<u8>, creation_ts: u32, duration: u64, next_track_id: u32) {
    write_box(buf, b"mvhd", |b| {
        b.write_u32::<BigEndian>(0).unwrap(); // version/flags
        b.write_u32::<BigEndian>(creation_ts).unwrap();
        b.write_u32::<BigEndian>(creation_ts).unwrap();
        b.write_u32::<BigEndian>(TIMESCALE).unwrap();
        b.write_u32::<BigEndian>(duration as u32).unwrap();
        b.write_u32::<BigEndian>(0x0001_0000).unwrap(); // rate 1.0
        b.write_u16::<BigEndian>(0x0100).unwrap(); // volume 1.0
        b.write_u16::<BigEndian>(0).unwrap(); // reserved
        b.write_u64::<BigEndian>(0).unwrap(); // reserved[2]
        for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
            b.write_i32::<BigEndian>(v).unwrap(); // unity matrix
        }
        b.write_u64::<BigEndian>(0).unwrap(); // pre_defined[6] (partial)
        b.write_u64::<BigEndian>(0).unwrap();
        b.write_u32::<BigEndian>(0).unwrap();
        b.write_u32::<BigEndian>(next_track_id).unwrap();
    });
}

fn write_video_trak(buf: &mut Vec<u8>, cur: &OpenFile, creation_ts: u32, co64_patches: &mut Vec<(usize, u64)>) {
    write_box(buf, b"trak", |b| {
        write_tkhd(b, 1, creation_ts, cur.video.total_duration(), cur.video_params.width, cur.video_params.height);
        write_box(b, b"mdia", |b| {
            write_mdhd(b, creation_ts, cur.video.total_duration());
            write_hdlr(b, b"vide", b"VideoHandler");
            write_box(b, b"minf", |b| {
                write_box(b, b"vmhd", |b| {
                    b.write_u32::<BigEndian>(1).unwrap(); // flags
                    b.write_u64::<BigEndian>(0).unwrap();
                });
                write_dinf(b);
                write_box(b, b"stbl", |b| {
                    write_video_stsd(b, &cur.video_params);
                    write_stts(b, &cur.video.samples);
                    write_stsc(b, cur.video.samples.len());
                    write_stsz(b, &cur.video.samples);
                    write_stss(b, &cur.video.samples);
                    write_co64(b, &cur.video.samples, co64_patches);
                });
            });
        });
    });
}

fn write_audio_trak(
    buf: &mut Vec<u8>,
    audio: &TrackBuilder,
    params: &AudioParameters,
    creation_ts: u32,
    co64_patches: &mut Vec<(usize, u64)>,
) {
    write_box(buf, b"trak", |b| {
        write_tkhd(b, 2, creation_ts, audio.total_duration(), 0, 0);
        write_box(b, b"mdia", |b| {
            write_mdhd(b, creation_ts, audio.total_duration());
            write_hdlr(b, b"soun", b"SoundHandler");
            write_box(b, b"minf", |b| {
                write_box(b, b"smhd", |b| {
                    b.write_u32::<BigEndian>(0).unwrap();
                    b.write_u32::<BigEndian>(0).unwrap();
                });
                write_dinf(b);
                write_box(b, b"stbl", |b| {
                    write_audio_stsd(b, params);
                    write_stts(b, &audio.samples);
                    write_stsc(b, audio.samples.len());
                    write_stsz(b, &audio.samples);
                    write_co64(b, &audio.samples, co64_patches);
                });
            });
        });
    });
}

fn write_tkhd(buf: &mut Vec<u8>, track_id: u32, creation_ts: u32, duration: u64, width: u16, height: u16) {
    write_box(buf, b"tkhd", |b| {
        b.write_u32::<BigEndian>(0x0000_0007).unwrap(); // version 0, flags: enabled+in movie+in preview
        b.write_u32::<BigEndian>(creation_ts).unwrap();
        b.write_u32::<BigEndian>(creation_ts).unwrap();
        b.write_u32::<BigEndian>(track_id).unwrap();
        b.write_u32::<BigEndian>(0).unwrap(); // reserved
        b.write_u32::<BigEndian>(duration as u32).unwrap();
        b.write_u64::<BigEndian>(0).unwrap(); // reserved[2]
        b.write_u16::<BigEndian>(0).unwrap(); // layer
        b.write_u16::<BigEndian>(0).unwrap(); // alternate_group
        b.write_u16::<BigEndian>(if width == 0 { 0x0100 } else { 0 }).unwrap(); // volume
        b.write_u16::<BigEndian>(0).unwrap(); // reserved
        for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
            b.write_i32::<BigEndian>(v).unwrap();
        }
        b.write_u32::<BigEndian>(u32::from(width) << 16).unwrap();
        b.write_u32::<BigEndian>(u32::from(height) << 16).unwrap();
    });
}

fn write_mdhd(buf: &mut Vec<u8>, creation_ts: u32, duration: u64) {
    write_box(buf, b"mdhd", |b| {
        b.write_u32::<BigEndian>(0).unwrap();
        b.write_u32::<BigEndian>(creation_ts).unwrap();
        b.write_u32::<BigEndian>(creation_ts).unwrap();
        b.write_u32::<BigEndian>(TIMESCALE).unwrap();
        b.write_u32::<BigEndian>(duration as u32).unwrap();
        b.write_u16::<BigEndian>(0x55c4).unwrap(); // language "und"
        b.write_u16::<BigEndian>(0).unwrap();
    });
}

fn write_hdlr(buf: &mut Vec<u8>, subtype: &[u8; 4], name: &str) {
    write_box(buf, b"hdlr", |b| {
        b.write_u32::<BigEndian>(0).unwrap();
        b.write_u32::<BigEndian>(0).unwrap(); // pre_defined
        b.extend_from_slice(subtype);
        b.write_u64::<BigEndian>(0).unwrap(); // reserved[3] (partial)
        b.write_u32::<BigEndian>(0).unwrap();
        b.extend_from_slice(name.as_bytes());
        b.push(0);
    });
}

fn write_dinf(buf: &mut Vec<u8>) {
    write_box(buf, b"dinf", |b| {
        write_box(b, b"dref", |b| {
            b.write_u32::<BigEndian>(0).unwrap();
            b.write_u32::<BigEndian>(1).unwrap();
            write_box(b, b"url ", |b| {
                b.write_u32::<BigEndian>(1).unwrap(); // flags: self-contained
            });
        });
    });
}

fn write_video_stsd(buf: &mut Vec<u8>, params: &VideoParameters) {
    write_box(buf, b"stsd", |b| {
        b.write_u32::<BigEndian>(0).unwrap();
        b.write_u32::<BigEndian>(1).unwrap(); // entry_count
        write_box(b, b"avc1", |b| {
            b.write_u48::<BigEndian>(0).unwrap(); // reserved
            b.write_u16::<BigEndian>(1).unwrap(); // data_reference_index
            b.write_u32::<BigEndian>(0).unwrap(); // pre_defined/reserved
            b.write_u64::<BigEndian>(0).unwrap();
            b.write_u32::<BigEndian>(0).unwrap();
            b.write_u16::<BigEndian>(params.width).unwrap();
            b.write_u16::<BigEndian>(params.height).unwrap();
            b.write_u32::<BigEndian>(0x0048_0000).unwrap(); // horizresolution 72dpi
            b.write_u32::<BigEndian>(0x0048_0000).unwrap(); // vertresolution
            b.write_u32::<BigEndian>(0).unwrap(); // reserved
            b.write_u16::<BigEndian>(1).unwrap(); // frame_count
            b.extend_from_slice(&[0u8; 32]); // compressorname
            b.write_u16::<BigEndian>(0x0018).unwrap(); // depth
            b.write_i16::<BigEndian>(-1).unwrap(); // pre_defined
            write_box(b, b"avcC", |b| {
                // `extra_data` is the AVCDecoderConfigurationRecord retina
                // hands back from the SDP/SPS-PPS exchange, carried through
                // unmodified (§4.F: "initialization copies codec parameters").
                b.extend_from_slice(&params.extra_data);
            });
        });
    });
}

fn write_audio_stsd(buf: &mut Vec<u8>, params: &AudioParameters) {
    write_box(buf, b"stsd", |b| {
        b.write_u32::<BigEndian>(0).unwrap();
        b.write_u32::<BigEndian>(1).unwrap();
        write_box(b, b"mp4a", |b| {
            b.write_u48::<BigEndian>(0).unwrap();
            b.write_u16::<BigEndian>(1).unwrap(); // data_reference_index
            b.write_u64::<BigEndian>(0).unwrap(); // reserved[2]
            b.write_u16::<BigEndian>(params.channels).unwrap();
            b.write_u16::<BigEndian>(16).unwrap(); // sample_size
            b.write_u32::<BigEndian>(0).unwrap(); // pre_defined/reserved
            b.write_u32::<BigEndian>(params.sample_rate << 16).unwrap();
            write_box(b, b"esds", |b| {
                b.write_u32::<BigEndian>(0).unwrap();
                b.push(0x03); // ES_DescrTag
                b.push((3 + params.extra_data.len() + 5 + 2) as u8);
                b.write_u16::<BigEndian>(0).unwrap(); // ES_ID
                b.push(0); // flags
                b.push(0x04); // DecoderConfigDescrTag
                b.push((params.extra_data.len() + 2) as u8);
                b.push(0x40); // objectTypeIndication: MPEG-4 audio
                b.push(0x15); // streamType: audio, upstream=0, reserved=1
                b.push(0x05); // DecoderSpecificInfoTag
                b.push(params.extra_data.len() as u8);
                b.extend_from_slice(&params.extra_data);
            });
        });
    });
}

fn write_stts(buf: &mut Vec<u8>, samples: &[SampleRecord]) {
    write_box(buf, b"stts", |b| {
        b.write_u32::<BigEndian>(0).unwrap();
        // One (count=1, delta) entry per sample: simplest correct encoding,
        // not the most compact one (real recordings would run-length-encode
        // equal deltas, which for constant frame rate is nearly all of them).
        b.write_u32::<BigEndian>(samples.len() as u32).unwrap();
        for s in samples {
            b.write_u32::<BigEndian>(1).unwrap();
            b.write_u32::<BigEndian>(s.duration).unwrap();
        }
    });
}

fn write_stsc(buf: &mut Vec<u8>, sample_count: usize) {
    write_box(buf, b"stsc", |b| {
        b.write_u32::<BigEndian>(0).unwrap();
        if sample_count == 0 {
            b.write_u32::<BigEndian>(0).unwrap();
            return;
        }
        b.write_u32::<BigEndian>(1).unwrap();
        b.write_u32::<BigEndian>(1).unwrap(); // first_chunk
        b.write_u32::<BigEndian>(sample_count as u32).unwrap(); // samples_per_chunk: one chunk
        b.write_u32::<BigEndian>(1).unwrap(); // sample_description_index
    });
}

fn write_stsz(buf: &mut Vec<u8>, samples: &[SampleRecord]) {
    write_box(buf, b"stsz", |b| {
        b.write_u32::<BigEndian>(0).unwrap();
        b.write_u32::<BigEndian>(0).unwrap(); // sample_size: 0 => per-sample table follows
        b.write_u32::<BigEndian>(samples.len() as u32).unwrap();
        for s in samples {
            b.write_u32::<BigEndian>(s.size).unwrap();
        }
    });
}

fn write_stss(buf: &mut Vec<u8>, samples: &[SampleRecord]) {
    let sync: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_sync)
        .map(|(i, _)| (i + 1) as u32)
        .collect();
    write_box(buf, b"stss", |b| {
        b.write_u32::<BigEndian>(0).unwrap();
        b.write_u32::<BigEndian>(sync.len() as u32).unwrap();
        for n in sync {
            b.write_u32::<BigEndian>(n).unwrap();
        }
    });
}

/// Writes one chunk whose byte offset is a single contiguous run covering
/// all of this track's samples; offsets are patched in later once the mdat
/// start position (which depends on this very moov's total size) is known.
fn write_co64(buf: &mut Vec<u8>, samples: &[SampleRecord], patches: &mut Vec<(usize, u64)>) {
    write_box(buf, b"co64", |b| {
        b.write_u32::<BigEndian>(0).unwrap();
        if samples.is_empty() {
            b.write_u32::<BigEndian>(0).unwrap();
            return;
        }
        b.write_u32::<BigEndian>(1).unwrap(); // entry_count: one chunk
        let pos = b.len();
        b.write_u64::<BigEndian>(0).unwrap(); // placeholder, patched post-hoc
        patches.push((pos, samples[0].offset));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TimeBase;
    use crate::ports::testutil::MemRecordingStore;
    use crate::ports::Trigger;

    fn video_params() -> VideoParameters {
        VideoParameters {
            width: 1920,
            height: 1080,
            extra_data: Bytes::from_static(b"fake-avcc"),
        }
    }

    fn vpkt(is_keyframe: bool) -> Packet {
        Packet {
            stream_idx: 0,
            is_video: true,
            is_keyframe,
            pts: Some(0),
            dts: Some(0),
            time_base: TimeBase::NINETY_KHZ,
            payload: Bytes::from_static(b"frame-data"),
        }
    }

    #[test]
    fn writes_a_playable_faststart_file_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemRecordingStore::default());
        let w = Mp4Writer::open(
            dir.path(),
            "cam0",
            Duration::from_secs(900),
            video_params(),
            None,
            store.clone(),
            Time(0),
            Trigger::Scheduled,
        )
        .unwrap();

        w.write_video(&vpkt(true), Time(0), Time(0)).unwrap();
        w.write_video(&vpkt(false), Time(3_000), Time(3_000)).unwrap();
        w.close().unwrap();

        let mut entries = Vec::new();
        visit(dir.path(), &mut entries);
        let mp4_path = entries.iter().find(|p| p.extension().map(|e| e == "mp4").unwrap_or(false));
        assert!(mp4_path.is_some(), "expected an .mp4 file under {dir:?}");

        let bytes = std::fs::read(mp4_path.unwrap()).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
        let ftyp_len = BigEndian::read_u32(&bytes[0..4]) as usize;
        assert_eq!(&bytes[ftyp_len + 4..ftyp_len + 8], b"moov", "moov must precede mdat (faststart)");
    }

    #[test]
    fn empty_segment_leaves_no_dangling_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemRecordingStore::default());
        let w = Mp4Writer::open(
            dir.path(),
            "cam0",
            Duration::from_secs(900),
            video_params(),
            None,
            store,
            Time(0),
            Trigger::Scheduled,
        )
        .unwrap();
        w.close().unwrap();
        let mut entries = Vec::new();
        visit(dir.path(), &mut entries);
        assert!(entries.iter().all(|p| p.extension().map(|e| e != "mp4").unwrap_or(true)));
    }

    #[test]
    fn trigger_motion_opens_a_motion_tagged_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemRecordingStore::default());
        let w = Mp4Writer::open(
            dir.path(),
            "cam0",
            Duration::from_secs(900),
            video_params(),
            None,
            store.clone(),
            Time(0),
            Trigger::Scheduled,
        )
        .unwrap();
        w.write_video(&vpkt(true), Time(0), Time(0)).unwrap();

        let trigger_at = Time(1_000_000);
        w.trigger_motion(Duration::from_secs(5), Duration::from_secs(10), trigger_at).unwrap();
        w.write_video(&vpkt(true), Time(1_090_000), Time(1_090_000)).unwrap();
        let second_id = w.recording_id().unwrap();
        w.close().unwrap();

        let meta = store.get(second_id).unwrap().unwrap();
        assert_eq!(meta.trigger, Trigger::Motion);
        // Pre-buffer backdates the new file's recorded start relative to the
        // trigger instant, since the just-closed file already covers it.
        assert!(meta.start_time.0 < trigger_at.0);
        assert_eq!(trigger_at.0 - meta.start_time.0, 5 * base::time::TIME_UNITS_PER_SEC);
    }

    #[test]
    fn trigger_motion_defers_scheduled_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemRecordingStore::default());
        let w = Mp4Writer::open(
            dir.path(),
            "cam0",
            Duration::from_millis(1),
            video_params(),
            None,
            store,
            Time(0),
            Trigger::Scheduled,
        )
        .unwrap();
        w.write_video(&vpkt(true), Time(0), Time(0)).unwrap();
        w.trigger_motion(Duration::ZERO, Duration::from_secs(60), Time(0)).unwrap();
        let motion_id = w.recording_id().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        w.write_video(&vpkt(true), Time(90_000), Time(90_000)).unwrap();
        assert_eq!(
            w.recording_id().unwrap(),
            motion_id,
            "scheduled rotation must not cut a motion recording's post-buffer short"
        );
    }

    fn visit(dir: &Path, out: &mut Vec<PathBuf>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                visit(&path, out);
            } else {
                out.push(path);
            }
        }
    }

    #[test]
    fn civil_from_days_matches_known_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2023, 12, 25));
    }
}
