// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock referee process.
//
// Usage:
//   lock_referee [rendezvous]
//
// Configuration comes from ROBUST_IPC_* environment variables; a rendezvous
// argument overrides ROBUST_IPC_REFEREE. Exits quietly with status 0 when
// another referee already owns the rendezvous. Log level via RUST_LOG.

use std::sync::Arc;

use robust_ipc::referee::server;
use robust_ipc::{Referee, RefereeConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = RefereeConfig::from_env();
    if let Some(name) = std::env::args().nth(1) {
        config.rendezvous = name;
    }

    let (listener, _guard) = match server::bind(&config) {
        Ok(Some(bound)) => bound,
        Ok(None) => {
            tracing::info!(rendezvous = %config.rendezvous, "referee already running");
            return;
        }
        Err(e) => {
            tracing::error!(rendezvous = %config.rendezvous, error = %e, "cannot claim rendezvous");
            std::process::exit(1);
        }
    };

    let referee = match Referee::new(&config.rendezvous, config.record_capacity) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::error!(error = %e, "cannot create robust record table");
            std::process::exit(1);
        }
    };

    tracing::info!(
        rendezvous = %config.rendezvous,
        socket = %config.socket_path().display(),
        capacity = config.record_capacity,
        "lock referee listening"
    );
    if let Err(e) = server::serve(listener, referee) {
        tracing::error!(error = %e, "accept loop failed");
        std::process::exit(1);
    }
}
