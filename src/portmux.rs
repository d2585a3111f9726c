// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Port-multiplexer daemon interface.
//!
//! The daemon is an external service that maps `(app, service, instance)`
//! to a live TCP port; the core only registers its own tuple and resolves
//! peers'. Implementations may block briefly; calls happen off the hot
//! path (connector retries and the watchdog's re-registration tick).

use anyhow::Result;

pub trait PortMux: Send + Sync {
    /// Claim a port for our own tuple; called once at startup and again on
    /// every re-registration interval. Returning a different port than the
    /// first call is fatal to the caller.
    fn register(&self, app: &str, service: &str, instance: &str) -> Result<u16>;

    /// Pin an explicitly configured port with the daemon.
    fn use_port(&self, app: &str, service: &str, instance: &str, port: u16) -> Result<()>;

    /// Resolve the port a remote host's tuple is listening on.
    fn get(&self, host: &str, app: &str, service: &str, instance: &str) -> Result<u16>;
}
