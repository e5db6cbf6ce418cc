// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! HLS Writer (§4.E): segments live video into a rolling-window playlist on
//! disk, rotating only at keyframe boundaries and pruning old segments after
//! a grace period so a reader mid-GET never sees a file vanish underneath it.

use crate::packet::Packet;
use base::time::Time;
use base::{bail, err, Error};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Rolling playlist window (§3: "default 6 segments").
const DEFAULT_WINDOW: usize = 6;

#[derive(Clone, Debug)]
struct Segment {
    index: u64,
    path: PathBuf,
    start_time: Time,
    duration: Duration,
    closed_at: std::time::Instant,
}

struct Inner {
    dir: PathBuf,
    segment_duration: Duration,
    window: usize,
    next_index: u64,
    /// Segments currently listed in the playlist (at most `window`).
    segments: Vec<Segment>,
    /// Segments that fell out of the playlist window but haven't yet aged
    /// past the deletion grace (§3); files here still exist on disk.
    retiring: Vec<Segment>,
    current: Option<CurrentSegment>,
    waiting_for_keyframe: bool,
    ended: bool,
}

struct CurrentSegment {
    index: u64,
    start_time: Time,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: fs::File,
    opened_at: std::time::Instant,
}

/// Writes one stream's live HLS output. Owns no thread of its own; the
/// worker (§4.H) calls `write_video`/`write_audio` inline on its packet loop
/// and `close` at shutdown.
pub struct HlsWriter {
    inner: Mutex<Inner>,
}

impl HlsWriter {
    /// Creates `dir` (mode 0777, so a fronting web server can read it without
    /// running as this process's user) and verifies it's writable by the
    /// current user by touching a dotfile. Fails with `PermissionDenied` if
    /// either step fails.
    pub fn create(dir: &Path, segment_duration: Duration) -> Result<Self, Error> {
        Self::create_with_window(dir, segment_duration, DEFAULT_WINDOW)
    }

    pub fn create_with_window(dir: &Path, segment_duration: Duration, window: usize) -> Result<Self, Error> {
        fs::create_dir_all(dir).map_err(|e| {
            err!(PermissionDenied, msg("creating HLS directory {dir:?}"), source(e))
        })?;
        Self::set_mode_0777(dir)?;

        let probe = dir.join(".moonfire-writable");
        fs::File::create(&probe)
            .and_then(|mut f| f.write_all(b"ok"))
            .map_err(|e| {
                err!(
                    PermissionDenied,
                    msg("HLS directory {dir:?} is not writable"),
                    source(e)
                )
            })?;
        let _ = fs::remove_file(&probe);

        Ok(HlsWriter {
            inner: Mutex::new(Inner {
                dir: dir.to_path_buf(),
                segment_duration,
                window,
                next_index: 0,
                segments: Vec::new(),
                retiring: Vec::new(),
                current: None,
                waiting_for_keyframe: false,
                ended: false,
            }),
        })
    }

    #[cfg(unix)]
    fn set_mode_0777(dir: &Path) -> Result<(), Error> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o777))
            .map_err(|e| err!(PermissionDenied, msg("chmod HLS directory {dir:?}"), source(e)))
    }

    #[cfg(not(unix))]
    fn set_mode_0777(_dir: &Path) -> Result<(), Error> {
        Ok(())
    }

    /// Writes one video packet (post-timestamp-tracker). Rotation is deferred
    /// to the next keyframe if the current segment has already run past its
    /// target duration (§4.E: "only key-frame boundaries may start a new
    /// segment").
    pub fn write_video(&self, pkt: &Packet, out_pts: Time) -> Result<(), Error> {
        if !pkt.is_video {
            bail!(Bug, msg("write_video called with a non-video packet"));
        }
        let mut inner = self.inner.lock();
        if inner.ended {
            return Ok(());
        }

        if inner.current.is_none() {
            if !pkt.is_keyframe {
                debug!("dropping leading non-keyframe before first HLS segment");
                return Ok(());
            }
            inner.open_segment(out_pts)?;
        } else if pkt.is_keyframe {
            let due = inner
                .current
                .as_ref()
                .map(|c| c.opened_at.elapsed() >= inner.segment_duration)
                .unwrap_or(false);
            if due {
                inner.rotate(out_pts)?;
            } else {
                inner.waiting_for_keyframe = false;
            }
        } else if inner
            .current
            .as_ref()
            .map(|c| c.opened_at.elapsed() >= inner.segment_duration)
            .unwrap_or(false)
        {
            inner.waiting_for_keyframe = true;
        }

        inner.write_payload(&pkt.payload)?;
        inner.write_playlist()?;
        Ok(())
    }

    /// Non-video packets are not carried into HLS segments in this design
    /// (the live view is video-only); kept as a named no-op so the worker's
    /// dispatch loop doesn't need a special case.
    pub fn write_audio(&self, _pkt: &Packet, _out_pts: Time) -> Result<(), Error> {
        Ok(())
    }

    /// Closes the current segment and writes `#EXT-X-ENDLIST` (§4.E: only at
    /// graceful shutdown).
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.ended {
            return Ok(());
        }
        if inner.current.is_some() {
            inner.finish_current()?;
        }
        inner.ended = true;
        inner.write_playlist()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    pub fn waiting_for_keyframe(&self) -> bool {
        self.inner.lock().waiting_for_keyframe
    }
}

/// §6: "Files have mode 0666 inside a 0777 directory so a fronting web
/// server can read them."
#[cfg(unix)]
fn set_mode_0666(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))
        .map_err(|e| err!(WriterIOError, msg("chmod {path:?}"), source(e)))
}

#[cfg(not(unix))]
fn set_mode_0666(_path: &Path) -> Result<(), Error> {
    Ok(())
}

impl Inner {
    fn open_segment(&mut self, start_time: Time) -> Result<(), Error> {
        let index = self.next_index;
        self.next_index += 1;
        let final_path = self.dir.join(format!("seg-{index:010}.ts"));
        let tmp_path = self.dir.join(format!(".seg-{index:010}.ts.tmp"));
        let file = fs::File::create(&tmp_path)
            .map_err(|e| err!(WriterIOError, msg("creating segment {tmp_path:?}"), source(e)))?;
        set_mode_0666(&tmp_path)?;
        self.current = Some(CurrentSegment {
            index,
            start_time,
            tmp_path,
            final_path,
            file,
            opened_at: std::time::Instant::now(),
        });
        self.waiting_for_keyframe = false;
        Ok(())
    }

    fn write_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        let Some(cur) = self.current.as_mut() else {
            return Ok(());
        };
        cur.file
            .write_all(payload)
            .map_err(|e| err!(WriterIOError, msg("writing HLS segment payload"), source(e)))
    }

    fn rotate(&mut self, next_start: Time) -> Result<(), Error> {
        self.finish_current()?;
        self.open_segment(next_start)
    }

    /// Flushes and atomically renames the current segment's temp file, then
    /// prunes segments that have aged out of the window *and* past the
    /// `2 x segment_duration` deletion grace (§3).
    fn finish_current(&mut self) -> Result<(), Error> {
        let Some(cur) = self.current.take() else {
            return Ok(());
        };
        cur.file
            .sync_all()
            .map_err(|e| err!(WriterIOError, msg("flushing HLS segment"), source(e)))?;
        fs::rename(&cur.tmp_path, &cur.final_path).map_err(|e| {
            err!(
                WriterIOError,
                msg("renaming HLS segment {:?} -> {:?}", cur.tmp_path, cur.final_path),
                source(e)
            )
        })?;
        let duration = cur.opened_at.elapsed();
        self.segments.push(Segment {
            index: cur.index,
            path: cur.final_path,
            start_time: cur.start_time,
            duration,
            closed_at: std::time::Instant::now(),
        });
        self.prune();
        Ok(())
    }

    /// Moves segments older than the playlist window into `retiring`, then
    /// deletes from `retiring` anything past the deletion grace (§3:
    /// `2 x segment_duration`), so a reader that just fetched the playlist
    /// still has time to GET a file before it disappears.
    fn prune(&mut self) {
        if self.segments.len() > self.window {
            let excess = self.segments.len() - self.window;
            self.retiring.extend(self.segments.drain(..excess));
        }

        let grace = self.segment_duration.saturating_mul(2);
        let mut removed = 0;
        for seg in &self.retiring {
            if seg.closed_at.elapsed() < grace {
                break;
            }
            match fs::remove_file(&seg.path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed += 1,
                Err(e) => {
                    warn!(path = %seg.path.display(), error = %e, "failed to prune HLS segment");
                    break;
                }
            }
        }
        self.retiring.drain(..removed);
    }

    fn write_playlist(&self) -> Result<(), Error> {
        let target_duration = self.segment_duration.as_secs().max(1);
        let media_sequence = self.segments.first().map(|s| s.index).unwrap_or(self.next_index);

        let mut text = String::with_capacity(128 + 64 * self.segments.len());
        writeln!(text, "#EXTM3U").unwrap();
        writeln!(text, "#EXT-X-VERSION:3").unwrap();
        writeln!(text, "#EXT-X-TARGETDURATION:{target_duration}").unwrap();
        writeln!(text, "#EXT-X-MEDIA-SEQUENCE:{media_sequence}").unwrap();
        for seg in &self.segments {
            writeln!(text, "#EXTINF:{:.3},", seg.duration.as_secs_f64()).unwrap();
            writeln!(text, "{}", seg.path.file_name().unwrap().to_string_lossy()).unwrap();
        }
        if self.ended {
            writeln!(text, "#EXT-X-ENDLIST").unwrap();
        }

        let final_path = self.dir.join("index.m3u8");
        let tmp_path = self.dir.join(".index.m3u8.tmp");
        fs::write(&tmp_path, text.as_bytes())
            .map_err(|e| err!(WriterIOError, msg("writing playlist {tmp_path:?}"), source(e)))?;
        set_mode_0666(&tmp_path)?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|e| err!(WriterIOError, msg("renaming playlist into place"), source(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TimeBase;
    use bytes::Bytes;

    fn vpkt(is_keyframe: bool) -> Packet {
        Packet {
            stream_idx: 0,
            is_video: true,
            is_keyframe,
            pts: Some(0),
            dts: Some(0),
            time_base: TimeBase::NINETY_KHZ,
            payload: Bytes::from_static(b"frame"),
        }
    }

    #[test]
    fn creates_writable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("cam0");
        let w = HlsWriter::create(&sub, Duration::from_secs(2)).unwrap();
        assert!(sub.is_dir());
        assert_eq!(w.segment_count(), 0);
    }

    #[test]
    fn first_segment_starts_only_at_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let w = HlsWriter::create(dir.path(), Duration::from_secs(2)).unwrap();
        w.write_video(&vpkt(false), Time(0)).unwrap();
        assert_eq!(w.segment_count(), 0, "non-keyframe must not open a segment");
        w.write_video(&vpkt(true), Time(0)).unwrap();
        // Segment is open but not yet rotated/counted until the next keyframe.
        assert_eq!(w.segment_count(), 0);
    }

    #[test]
    fn rotation_only_happens_on_keyframe_after_duration_elapsed() {
        let dir = tempfile::tempdir().unwrap();
        let w = HlsWriter::create(dir.path(), Duration::from_millis(1)).unwrap();
        w.write_video(&vpkt(true), Time(0)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        w.write_video(&vpkt(false), Time(90_000)).unwrap();
        assert!(w.waiting_for_keyframe(), "must defer rotation for a non-keyframe");
        assert_eq!(w.segment_count(), 0);
        w.write_video(&vpkt(true), Time(180_000)).unwrap();
        assert_eq!(w.segment_count(), 1, "rotation happens on the next keyframe");
    }

    #[test]
    fn close_writes_endlist_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let w = HlsWriter::create(dir.path(), Duration::from_secs(2)).unwrap();
        w.write_video(&vpkt(true), Time(0)).unwrap();
        w.close().unwrap();
        let text = fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        assert_eq!(text.matches("#EXT-X-ENDLIST").count(), 1);
        w.close().unwrap();
        let text2 = fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        assert_eq!(text2.matches("#EXT-X-ENDLIST").count(), 1, "close must be idempotent");
    }
}
