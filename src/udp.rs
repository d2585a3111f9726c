// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Datagram side-channel.
//!
//! Reuses the peer directory (including the `last_used` cache) to find the
//! destination's cached address, then sends on a caller-supplied socket.
//! No retransmission, no ordering, no framing; only the per-peer counters
//! are maintained.

use tokio::net::UdpSocket;

use crate::{
    error::{SendError, SendResult},
    net::Net,
};

impl Net {
    /// Fire one datagram at `host` on the caller's socket. The target is
    /// the peer's cached address with its current net port; the cached
    /// socket port may be an ephemeral one from an inbound connection.
    pub async fn udp_send(
        &self,
        sock: &UdpSocket,
        host: &str,
        payload: &[u8],
    ) -> SendResult<usize> {
        let peer = self
            .directory()
            .lookup_name(host)
            .ok_or(SendError::InvalidNode)?;
        let cached = peer.cached_addr().ok_or(SendError::NoSock)?;
        let port = peer.port.load(std::sync::atomic::Ordering::Acquire);
        if port <= 0 {
            return Err(SendError::NoSock);
        }
        let target = std::net::SocketAddr::new(cached.ip(), port as u16);

        let sent = sock
            .send_to(payload, target)
            .await
            .map_err(|_| SendError::WriteFail)?;
        peer.udp_sent
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(sent)
    }

    /// Bump the inbound-datagram counter for `host`; the caller owns the
    /// receive loop.
    pub fn udp_note_recv(&self, host: &str) {
        if let Some(peer) = self.directory().lookup_name(host) {
            peer.udp_recv
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}
