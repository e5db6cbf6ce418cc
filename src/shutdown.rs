// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shutdown Coordinator (§4.A): a process-wide registry of named components
//! layered on top of `base::shutdown`'s one-shot broadcast. The broadcast
//! alone answers "has shutdown started"; the registry additionally tracks
//! per-component observed state and timeouts, so `initiate_shutdown` can
//! return a bounded time after asking, regardless of stuck workers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub type ComponentId = u64;

struct Registered {
    name: String,
    kind: &'static str,
    state: ComponentState,
    timeout: Duration,
}

pub struct Coordinator {
    shutdown_tx: Mutex<Option<base::shutdown::Sender>>,
    shutdown_rx: base::shutdown::Receiver,
    next_id: AtomicU64,
    components: Mutex<std::collections::HashMap<ComponentId, Registered>>,
}

impl Default for Coordinator {
    fn default() -> Self {
        let (tx, rx) = base::shutdown::channel();
        Coordinator {
            shutdown_tx: Mutex::new(Some(tx)),
            shutdown_rx: rx,
            next_id: AtomicU64::new(0),
            components: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cheap handle components can poll (`check()`) or block on
    /// (`wait_for(timeout)`) without touching the registry.
    pub fn receiver(&self) -> base::shutdown::Receiver {
        self.shutdown_rx.clone()
    }

    pub fn register(&self, name: impl Into<String>, kind: &'static str, timeout: Duration) -> ComponentId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.components.lock().insert(
            id,
            Registered {
                name: name.into(),
                kind,
                state: ComponentState::Starting,
                timeout,
            },
        );
        id
    }

    pub fn update_state(&self, id: ComponentId, state: ComponentState) {
        if let Some(r) = self.components.lock().get_mut(&id) {
            r.state = state;
        }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_rx.check().is_err()
    }

    /// Drops the broadcast sender (waking every `Receiver`, per
    /// `base::shutdown`'s contract), then polls the registry until every
    /// component reports STOPPED or its individual timeout elapses.
    /// Components that time out are logged but never prevent return — the
    /// coordinator's own guarantee (§4.A) is the hard bound, not theirs.
    pub fn initiate_shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            drop(tx);
        }

        let max_timeout = self
            .components
            .lock()
            .values()
            .map(|r| r.timeout)
            .max()
            .unwrap_or(Duration::ZERO);

        let deadline = Instant::now() + max_timeout;
        let poll_interval = Duration::from_millis(50).min(max_timeout.max(Duration::from_millis(1)));

        loop {
            let all_stopped = {
                let components = self.components.lock();
                components.values().all(|r| r.state == ComponentState::Stopped)
            };
            if all_stopped {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(poll_interval);
        }

        let components = self.components.lock();
        for r in components.values() {
            if r.state != ComponentState::Stopped {
                warn!(
                    component = %r.name,
                    kind = r.kind,
                    timeout_s = r.timeout.as_secs_f64(),
                    "component did not reach STOPPED before its shutdown timeout; abandoning"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_immediately_when_nothing_registered() {
        let c = Coordinator::new();
        let start = Instant::now();
        c.initiate_shutdown();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn bounded_even_with_a_stuck_component() {
        let c = Coordinator::new();
        let id = c.register("cam0-worker", "worker", Duration::from_millis(100));
        c.update_state(id, ComponentState::Running);
        // Never transitions to Stopped: simulates a hung worker.
        let start = Instant::now();
        c.initiate_shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(c.is_shutdown_initiated());
    }

    #[test]
    fn returns_as_soon_as_all_components_stop() {
        let c = Coordinator::new();
        let id = c.register("cam0-worker", "worker", Duration::from_secs(30));
        c.update_state(id, ComponentState::Stopped);
        let start = Instant::now();
        c.initiate_shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
