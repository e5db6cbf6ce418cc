// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The value type that flows from the RTSP session (§4.D) through the
//! timestamp tracker (§4.C) into the HLS and MP4 writers (§4.E, §4.F).

use bytes::Bytes;

/// A rational time base, as carried on the wire by the source codec (e.g.
/// `1/90000` for video, `1/48000` for AAC audio). The timestamp tracker
/// normalizes away from this into `base::time::Time`'s fixed 90kHz base, so
/// nothing downstream of it needs to know the original rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const NINETY_KHZ: TimeBase = TimeBase { num: 1, den: 90_000 };

    /// Rescales a timestamp from this base into 90,000ths-of-a-second units.
    pub fn to_90k(&self, ts: i64) -> i64 {
        // i128 to avoid overflow on the multiply before dividing.
        (i128::from(ts) * i128::from(self.num) * 90_000 / i128::from(self.den)) as i64
    }
}

/// One packet of media, moved (never aliased) from the RTSP session into the
/// worker and onward into the writers it's forwarded to.
#[derive(Clone, Debug)]
pub struct Packet {
    /// Index of the source stream within the session (0 = first offered
    /// stream, matching `retina`'s convention); distinguishes video from
    /// audio when a session carries both.
    pub stream_idx: u32,
    pub is_video: bool,
    pub is_keyframe: bool,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub time_base: TimeBase,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_90k_is_identity() {
        let tb = TimeBase::NINETY_KHZ;
        assert_eq!(tb.to_90k(12_345), 12_345);
    }

    #[test]
    fn rescale_48k_audio() {
        let tb = TimeBase { num: 1, den: 48_000 };
        // One second of 48kHz audio (48,000 ticks) is one second of 90kHz (90,000 ticks).
        assert_eq!(tb.to_90k(48_000), 90_000);
    }
}
