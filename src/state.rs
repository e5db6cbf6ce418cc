// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Stream State Manager (§4.B): one reference-counted `StreamState` per
//! active stream, replacing the source's "freed contexts" list and global
//! stop mutex (§9) with a single owner per context and atomic observation
//! fields for everyone else.

use base::{bail, Error, SharedError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Tags a reference so `release_ref` can be paired with the `add_ref` that
/// created it; not load-bearing for correctness (refcount is a single atomic),
/// but useful in logs to see which component is still holding a stream open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentTag {
    Hls,
    Mp4,
    Detection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    refs: AtomicU32,
    callbacks_enabled: AtomicBool,
    phase: Mutex<Phase>,
    last_error: Mutex<Option<SharedError>>,
}

/// A cloneable handle to one stream's state. Cheap to clone (an `Arc`
/// bump); all clones observe the same underlying state.
#[derive(Clone)]
pub struct StreamHandle(Arc<Inner>);

impl StreamHandle {
    pub fn phase(&self) -> Phase {
        *self.0.phase.lock()
    }

    pub fn callbacks_enabled(&self) -> bool {
        self.0.callbacks_enabled.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<SharedError> {
        self.0.last_error.lock().clone()
    }

    pub fn set_last_error(&self, e: Error) {
        *self.0.last_error.lock() = Some(Arc::new(e));
    }

    pub fn ref_count(&self) -> u32 {
        self.0.refs.load(Ordering::Acquire)
    }
}

/// Owns one `StreamState` per active stream name (§3). Stream state lives
/// here for the lifetime of the stream name's activity; a handle becomes
/// unreachable from `get_or_create` once its refcount has dropped to zero
/// and `release_ref` has finished the STOPPING → STOPPED transition.
#[derive(Default)]
pub struct StateManager {
    streams: Mutex<HashMap<String, StreamHandle>>,
    stopping: Mutex<std::collections::HashSet<String>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: returns the existing handle if the stream is already
    /// known and not yet fully torn down, else creates a fresh one in IDLE.
    pub fn get_or_create(&self, name: &str) -> StreamHandle {
        let mut streams = self.streams.lock();
        if let Some(h) = streams.get(name) {
            return h.clone();
        }
        let h = StreamHandle(Arc::new(Inner {
            refs: AtomicU32::new(0),
            callbacks_enabled: AtomicBool::new(true),
            phase: Mutex::new(Phase::Idle),
            last_error: Mutex::new(None),
        }));
        streams.insert(name.to_string(), h.clone());
        h
    }

    /// Fails if the stream's phase is STOPPING or STOPPED (§3 invariant: "A
    /// new reference cannot be acquired while phase ∈ {STOPPING, STOPPED}").
    pub fn add_ref(&self, handle: &StreamHandle, _component: ComponentTag) -> Result<(), Error> {
        let phase = handle.phase();
        if matches!(phase, Phase::Stopping | Phase::Stopped) {
            bail!(
                FailedPrecondition,
                msg("cannot add a reference while stream is {phase:?}")
            );
        }
        handle.0.refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// When the total reference count reaches zero, transitions
    /// STOPPING → STOPPED. Reaching zero outside of STOPPING is a caller bug
    /// (a reference was released that was never validly acquired under this
    /// stop cycle) and is reported as such rather than silently ignored.
    pub fn release_ref(&self, handle: &StreamHandle, _component: ComponentTag) {
        let prev = handle.0.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release_ref with no outstanding reference");
        if prev == 1 {
            let mut phase = handle.0.phase.lock();
            if *phase == Phase::Stopping {
                *phase = Phase::Stopped;
            }
        }
    }

    pub fn mark_stopping(&self, name: &str) {
        self.stopping.lock().insert(name.to_string());
        if let Some(h) = self.streams.lock().get(name) {
            *h.0.phase.lock() = Phase::Stopping;
            h.0.callbacks_enabled.store(false, Ordering::Release);
        }
    }

    pub fn unmark_stopping(&self, name: &str) {
        self.stopping.lock().remove(name);
    }

    pub fn is_stopping(&self, name: &str) -> bool {
        self.stopping.lock().contains(name)
    }

    pub fn set_callbacks_enabled(&self, handle: &StreamHandle, enabled: bool) {
        handle.0.callbacks_enabled.store(enabled, Ordering::Release);
    }

    pub fn set_phase(&self, handle: &StreamHandle, phase: Phase) {
        *handle.0.phase.lock() = phase;
    }

    /// Drops the handle from the lookup table once it's fully torn down;
    /// future `get_or_create` calls for this name start fresh.
    pub fn forget(&self, name: &str) {
        self.streams.lock().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let m = StateManager::new();
        let a = m.get_or_create("cam0");
        let b = m.get_or_create("cam0");
        a.set_last_error(base::err!(Unreachable));
        assert!(b.last_error().is_some(), "a and b must share the same inner state");
    }

    #[test]
    fn add_ref_rejected_while_stopping() {
        let m = StateManager::new();
        let h = m.get_or_create("cam0");
        m.add_ref(&h, ComponentTag::Hls).unwrap();
        m.mark_stopping("cam0");
        assert!(m.add_ref(&h, ComponentTag::Mp4).is_err());
    }

    #[test]
    fn refcount_reaches_zero_exactly_once_per_cycle() {
        let m = StateManager::new();
        let h = m.get_or_create("cam0");
        m.add_ref(&h, ComponentTag::Hls).unwrap();
        m.add_ref(&h, ComponentTag::Mp4).unwrap();
        m.mark_stopping("cam0");
        assert_eq!(h.phase(), Phase::Stopping);
        m.release_ref(&h, ComponentTag::Hls);
        assert_eq!(h.phase(), Phase::Stopping, "still one ref outstanding");
        m.release_ref(&h, ComponentTag::Mp4);
        assert_eq!(h.phase(), Phase::Stopped);
        assert_eq!(h.ref_count(), 0);
    }

    #[test]
    fn callbacks_disabled_when_stopping() {
        let m = StateManager::new();
        let h = m.get_or_create("cam0");
        assert!(h.callbacks_enabled());
        m.mark_stopping("cam0");
        assert!(!h.callbacks_enabled());
    }
}
