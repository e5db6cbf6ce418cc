// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Binary entry point (§2.A): parses arguments, installs logging, loads
//! configuration, wires the Supervisor to its default persistence ports, and
//! blocks until the Shutdown Coordinator reports every worker gone.

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

mod config;
mod detection;
mod hls;
mod mp4;
mod packet;
mod ports;
mod rtsp;
mod shutdown;
mod state;
mod store;
mod supervisor;
mod timestamp;
mod worker;

use config::Config;
use shutdown::Coordinator;
use state::StateManager;
use store::{JsonlSink, SqliteStore};
use supervisor::Supervisor;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn parse_path_opt(name: &'static str, help: &'static str, default: &'static str) -> impl bpaf::Parser<PathBuf> {
    bpaf::long(name)
        .help(help)
        .argument::<PathBuf>("PATH")
        .fallback(default.into())
        .debug_fallback()
}

fn parse_config_path() -> impl bpaf::Parser<PathBuf> {
    parse_path_opt("config", "Path to the TOML configuration file.", "/etc/moonfire-nvr/config.toml")
}

fn parse_store_path() -> impl bpaf::Parser<PathBuf> {
    parse_path_opt(
        "store",
        "Path to the SQLite recording metadata store.",
        "/var/lib/moonfire-nvr/recordings.db",
    )
}

fn parse_detections_path() -> impl bpaf::Parser<PathBuf> {
    parse_path_opt(
        "detections",
        "Path to the JSON-lines detection sink.",
        "/var/lib/moonfire-nvr/detections.jsonl",
    )
}

/// Moonfire NVR: security camera network video recorder.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
struct Args {
    #[bpaf(external(parse_config_path))]
    config: PathBuf,
    #[bpaf(external(parse_store_path))]
    store: PathBuf,
    #[bpaf(external(parse_detections_path))]
    detections: PathBuf,
}

fn run(args: Args) -> Result<i32, Error> {
    let toml = std::fs::read_to_string(&args.config).map_err(|e| {
        base::err!(
            ConfigInvalid,
            msg("reading configuration file {}", args.config.display()),
            source(e)
        )
    })?;
    let config = Config::from_toml_str(&toml)?;
    info!(streams = config.streams.len(), "configuration loaded");

    let recording_store: Arc<dyn ports::RecordingStore> = Arc::new(SqliteStore::open(&args.store)?);
    let detection_sink: Arc<dyn ports::DetectionSink> = Arc::new(JsonlSink::open(&args.detections)?);
    let state_manager = Arc::new(StateManager::new());
    let coordinator = Arc::new(Coordinator::new());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| base::err!(Internal, msg("building tokio runtime"), source(e)))?;

    let supervisor = Supervisor::new(
        config.max_streams,
        std::time::Duration::from_secs(u64::from(config.startup_delay_secs)),
        rt.handle().clone(),
        state_manager,
        coordinator.clone(),
        recording_store,
        detection_sink,
    );

    // §6: "On startup the supervisor calls `list_incomplete_for_stream` for
    // each configured stream" before any worker is spawned.
    supervisor.reconcile_on_startup(&config.streams)?;

    for stream in &config.streams {
        if let Err(e) = supervisor.start(stream.clone(), None) {
            warn!(stream = %stream.name, error = %e, "failed to start stream at startup");
        }
    }

    install_signal_handlers(coordinator.clone());

    let shutdown_rx = coordinator.receiver();
    while shutdown_rx.check().is_ok() {
        // Re-issued each iteration: `wait_for` returns `Ok` either on
        // shutdown or on a spurious timeout, so the `check()` above is the
        // actual loop condition.
        let _ = shutdown_rx.wait_for(std::time::Duration::from_secs(3600));
    }

    for stream in &config.streams {
        if let Err(e) = supervisor.stop(&stream.name) {
            warn!(stream = %stream.name, error = %e, "error stopping stream during shutdown");
        }
    }

    info!("all streams stopped; exiting");
    Ok(0)
}

fn install_signal_handlers(coordinator: Arc<Coordinator>) {
    std::thread::spawn(move || {
        if let Err(e) = wait_for_signal() {
            error!(error = %e, "signal handler failed; initiating shutdown anyway");
        }
        info!("shutdown signal received");
        coordinator.initiate_shutdown();
    });
}

#[cfg(unix)]
fn wait_for_signal() -> Result<(), Error> {
    use std::sync::atomic::{AtomicBool, Ordering};
    static RECEIVED: AtomicBool = AtomicBool::new(false);
    extern "C" fn handler(_: libc::c_int) {
        RECEIVED.store(true, Ordering::Release);
    }
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
    while !RECEIVED.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    Ok(())
}

#[cfg(not(unix))]
fn wait_for_signal() -> Result<(), Error> {
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

fn main() {
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment. See the troubleshooting guide."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    let args = args().fallback_to_usage().run();

    match run(args) {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => std::process::exit(rv),
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
