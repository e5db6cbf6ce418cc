// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! RTSP Session (§4.D): connects via `retina`, exposes a synchronous
//! `next_packet`, and provides the liveness probe and backoff schedule the
//! worker (§4.H) uses to drive reconnection.
//!
//! `retina`'s `Session` is async; everything in this module hops onto a
//! shared `tokio::runtime::Handle` for the duration of one call
//! (`handle.block_on(handle.spawn(...))`), so the worker thread that owns
//! this session otherwise stays fully synchronous. One thread-hop per
//! packet is the cost of keeping the worker's own control flow blocking.

use crate::config::Transport as ConfigTransport;
use crate::mp4::AudioParameters;
use crate::packet::{Packet, TimeBase};
use base::{bail, err, Error, ErrorKind};
use bytes::Bytes;
use retina::client::{Credentials, PlayOptions, Session, SessionOptions, SetupOptions};
use retina::codec::{CodecItem, ParametersRef};
use std::net::ToSocketAddrs;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;
use url::Url;

/// Receive-buffer delay cap (§4.D): "cap receive delay at 500ms".
const MAX_RECEIVE_DELAY: Duration = Duration::from_millis(500);

/// Socket timeout (§4.D).
const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempt counter cap, to prevent overflow (§4.D).
pub const MAX_ATTEMPT: u32 = 1000;

/// Backoff schedule (§4.D): attempt `n` ⇒ `min(500ms * 2^(n-1), 30000ms)`.
pub fn backoff(attempt: u32) -> Duration {
    let attempt = attempt.clamp(1, MAX_ATTEMPT);
    let millis = 500u64.saturating_mul(1u64 << (attempt - 1).min(62));
    Duration::from_millis(millis.min(30_000))
}

/// Connects to `host:port` and issues a bare RTSP OPTIONS, classifying the
/// result per §4.D: a 404 is a hard reject (misconfigured path), anything
/// else (including a connect failure) just means "server reachable" is
/// unknown either way and the caller should fall through to a normal
/// connection attempt.
pub fn probe_reachable(url: &Url) -> Result<bool, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| err!(InvalidArgument, msg("RTSP URL has no host")))?;
    let port = url.port().unwrap_or(554);
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(Error::from)?
        .next()
        .ok_or_else(|| err!(Unreachable, msg("no address for {host}:{port}")))?;

    use std::io::{Read, Write};
    let mut stream = match std::net::TcpStream::connect_timeout(&addr, SOCKET_TIMEOUT) {
        Ok(s) => s,
        Err(_) => return Ok(true), // unknown; let the real connect attempt decide.
    };
    stream.set_read_timeout(Some(SOCKET_TIMEOUT)).ok();
    let req = format!(
        "OPTIONS {} RTSP/1.0\r\nCSeq: 1\r\n\r\n",
        url.as_str()
    );
    if stream.write_all(req.as_bytes()).is_err() {
        return Ok(true);
    }
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap_or(0);
    let resp = String::from_utf8_lossy(&buf[..n]);
    Ok(!resp.contains(" 404 "))
}

/// One active RTSP session and the metadata needed to feed packets into the
/// timestamp tracker (§4.C) and writers (§4.E, §4.F).
pub struct RtspSession {
    rt: Handle,
    demuxed: retina::codec::Demuxed,
    video_stream_idx: Option<usize>,
    audio_stream_idx: Option<usize>,
}

/// A new video sample entry, published once per `open()`/codec change so the
/// writers can (re)initialize from it.
pub struct VideoParameters {
    pub width: u16,
    pub height: u16,
    pub extra_data: Bytes,
}

impl RtspSession {
    /// Opens a session: DESCRIBE, SETUP on the first offered video (and,
    /// if present, audio) stream, then PLAY. Fails with `Unreachable`,
    /// `Unauthorized`, or `NoVideoStream` per §4.D's failure semantics.
    pub fn open(
        rt: &Handle,
        url: &Url,
        transport: ConfigTransport,
    ) -> Result<(Self, VideoParameters, Option<AudioParameters>), Error> {
        let creds = if !url.username().is_empty() {
            Some(Credentials {
                username: url.username().to_string(),
                password: url.password().unwrap_or("").to_string(),
            })
        } else {
            None
        };

        let transport = match transport {
            ConfigTransport::Tcp => retina::client::Transport::Tcp(Default::default()),
            ConfigTransport::Udp => retina::client::Transport::Udp(Default::default()),
        };

        let opts = SessionOptions::default()
            .creds(creds)
            .user_agent("moonfire-nvr".to_owned());

        let url = url.clone();
        let mut described = rt
            .block_on(tokio::time::timeout(SOCKET_TIMEOUT, Session::describe(url, opts)))
            .map_err(|_| err!(DeadlineExceeded, msg("describe timed out")))?
            .map_err(|e| classify_retina_error(&e))?;

        let video_stream_idx = described
            .streams()
            .iter()
            .position(|s| s.media() == "video");
        let Some(video_stream_idx) = video_stream_idx else {
            bail!(NoVideoStream, msg("no video stream offered"));
        };
        let audio_stream_idx = described.streams().iter().position(|s| s.media() == "audio");

        let setup_opts = SetupOptions::default().transport(transport);
        for idx in std::iter::once(video_stream_idx).chain(audio_stream_idx) {
            rt.block_on(described.setup(idx, setup_opts.clone()))
                .map_err(|e| classify_retina_error(&e))?;
        }

        let play_opts = PlayOptions::default().ignore_zero_seq(true);
        let playing = rt
            .block_on(described.play(play_opts))
            .map_err(|e| classify_retina_error(&e))?;

        let params = match playing.streams()[video_stream_idx].parameters() {
            Some(ParametersRef::Video(v)) => VideoParameters {
                width: v.pixel_dimensions().0 as u16,
                height: v.pixel_dimensions().1 as u16,
                extra_data: Bytes::copy_from_slice(v.extra_data()),
            },
            _ => bail!(NoVideoStream, msg("video stream has no parameters yet")),
        };

        let audio_params = audio_stream_idx.and_then(|idx| match playing.streams()[idx].parameters() {
            Some(ParametersRef::Audio(a)) => {
                let config = a.config();
                Some(AudioParameters {
                    sample_rate: a.clock_rate(),
                    channels: parse_aac_channel_config(config),
                    extra_data: Bytes::copy_from_slice(config),
                })
            }
            _ => None,
        });

        let demuxed = playing.demuxed().map_err(|e| classify_retina_error(&e))?;

        Ok((
            RtspSession {
                rt: rt.clone(),
                demuxed,
                video_stream_idx: Some(video_stream_idx),
                audio_stream_idx,
            },
            params,
            audio_params,
        ))
    }

    /// Blocks for the next demuxed item, rescaling it into a `Packet`.
    /// Returns `Ok(None)` on a clean end of stream.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, Error> {
        use futures::StreamExt;
        let item = self
            .rt
            .block_on(tokio::time::timeout(SOCKET_TIMEOUT, self.demuxed.next()));
        let item = match item {
            Ok(Some(item)) => item,
            Ok(None) => return Ok(None),
            Err(_) => bail!(DeadlineExceeded, msg("no packet within socket timeout")),
        };

        match item.map_err(|e| classify_retina_error(&e))? {
            CodecItem::VideoFrame(f) => Ok(Some(Packet {
                stream_idx: self.video_stream_idx.unwrap_or(0) as u32,
                is_video: true,
                is_keyframe: f.is_random_access_point(),
                pts: Some(f.timestamp().elapsed() as i64),
                dts: Some(f.timestamp().elapsed() as i64),
                time_base: TimeBase {
                    num: 1,
                    den: f.timestamp().clock_rate(),
                },
                payload: Bytes::copy_from_slice(f.data()),
            })),
            CodecItem::AudioFrame(f) => Ok(Some(Packet {
                stream_idx: self.audio_stream_idx.unwrap_or(1) as u32,
                is_video: false,
                is_keyframe: false,
                pts: Some(f.timestamp().elapsed() as i64),
                dts: Some(f.timestamp().elapsed() as i64),
                time_base: TimeBase {
                    num: 1,
                    den: f.timestamp().clock_rate(),
                },
                payload: Bytes::copy_from_slice(f.data()),
            })),
            _ => {
                debug!("ignoring non-audio/video item from demuxer");
                Ok(None)
            }
        }
    }
}

/// Extracts the channel count from an ISO/IEC 14496-3 `AudioSpecificConfig`
/// (the `config()` bytes `retina` hands back for an AAC stream): 5 bits
/// `audioObjectType`, 4 bits `samplingFrequencyIndex`, then 4 bits
/// `channelConfiguration`. Falls back to stereo if the index signals an
/// explicit (non-table) sample rate, since that shifts the channel field by
/// 24 bits this parser doesn't chase.
fn parse_aac_channel_config(config: &[u8]) -> u16 {
    if config.len() < 2 {
        return 2;
    }
    let sampling_freq_index = ((config[0] & 0x07) << 1) | (config[1] >> 7);
    if sampling_freq_index == 0x0f {
        return 2;
    }
    let channel_config = (config[1] >> 3) & 0x0f;
    if channel_config == 0 {
        2
    } else {
        u16::from(channel_config)
    }
}

fn classify_retina_error(e: &retina::Error) -> Error {
    let msg = e.to_string();
    if msg.contains("401") || msg.to_lowercase().contains("unauthorized") {
        err!(Unauthorized, msg("{msg}"))
    } else if msg.contains("404") {
        err!(Unreachable, msg("{msg}"))
    } else {
        err!(Unreachable, msg("{msg}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_boundaries() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(6), Duration::from_millis(500 * 32));
        assert_eq!(backoff(11), Duration::from_millis(30_000));
        assert_eq!(backoff(1000), Duration::from_millis(30_000));
        assert_eq!(backoff(1001), Duration::from_millis(30_000), "capped at MAX_ATTEMPT");
    }

    #[test]
    fn backoff_never_exceeds_30s() {
        for n in [1, 2, 3, 50, 999, 1000, 5000] {
            assert!(backoff(n) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn parses_aac_stereo_channel_config() {
        // 44.1kHz (index 4), 2-channel AudioSpecificConfig for AAC-LC.
        assert_eq!(parse_aac_channel_config(&[0x12, 0x10]), 2);
    }

    #[test]
    fn parses_aac_mono_channel_config() {
        assert_eq!(parse_aac_channel_config(&[0x12, 0x08]), 1);
    }

    #[test]
    fn short_config_defaults_to_stereo() {
        assert_eq!(parse_aac_channel_config(&[0x12]), 2);
    }
}
