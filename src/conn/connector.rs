// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-peer connector task.
//!
//! Exists while the peer should be kept live. Dials whenever the peer has
//! no socket, with a random jitter up front so a cluster-wide partition
//! does not turn into a thundering herd of reconnects. It is also the sole
//! destroyer of the peer: on decommission or Net exit it waits for the
//! reader, writer, and throttle waiters to drain, then unlinks the record.

use std::{
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail};
use bytes::BytesMut;
use rand::{RngExt, SeedableRng, rngs::StdRng};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::{
    conn::{install_stream, write_all_or_cancel},
    net::Net,
    peer::Peer,
    subnet,
    wire::connect::ConnectMsg,
};

pub(crate) async fn connector_task(net: Arc<Net>, peer: Arc<Peer>) {
    net.run_thread_start();

    let mut rng = jitter_rng();
    let mut first_attempt = true;
    let mut last_dump = Instant::now();

    loop {
        if net.is_exiting() || (peer.is_decommissioned() && peer.is_really_closed()) {
            break;
        }

        if peer.is_really_closed() && !peer.is_decommissioned() {
            // jitter only on reconnects; it exists to break up the herd
            // after a partition, not to slow down bootstrap
            if !first_attempt {
                let jitter = Duration::from_millis(rng.random_range(0..5000u64));
                tokio::select! {
                    _ = net.exit_token().cancelled() => break,
                    _ = tokio::time::sleep(jitter) => {}
                }
            }
            first_attempt = false;
            // a socket may have been swung in by the accept path while we
            // slept; dialing now would just fight it
            if net.is_exiting() || peer.is_decommissioned() || !peer.is_really_closed() {
                continue;
            }

            peer.connect_attempts.fetch_add(1, Ordering::Relaxed);
            match try_connect(&net, &peer).await {
                Ok(()) => {
                    info!(host = %peer.host, subnet = ?peer.current_subnet(), "connected");
                }
                Err(e) => {
                    peer.connect_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(host = %peer.host, ?e, "connect failed");
                    tokio::select! {
                        _ = net.exit_token().cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        } else {
            // connected (or tearing down); wait for something to change
            let kick = peer.connector_kick.notified();
            tokio::select! {
                _ = net.exit_token().cancelled() => break,
                _ = tokio::time::timeout(Duration::from_secs(1), kick) => {}
            }
        }

        let dump_period = net.tuning().conntime_dump_period();
        if dump_period > 0 && last_dump.elapsed() >= Duration::from_secs(dump_period) {
            last_dump = Instant::now();
            info!(
                host = %peer.host,
                attempts = peer.connect_attempts.load(Ordering::Relaxed),
                failures = peer.connect_failures.load(Ordering::Relaxed),
                "connect totals"
            );
        }
    }

    // sole-destroyer path: nothing else may free the peer
    peer.close_connection();
    wait_for_drain(&peer).await;
    net.unlink_peer(&peer);
    peer.connector_bit().store(false, Ordering::Release);
    net.run_thread_stop();
}

/// One dial attempt: pick a subnet, resolve the port, connect, write the
/// connect frame, and hand the socket to the IO tasks.
async fn try_connect(net: &Arc<Net>, peer: &Arc<Peer>) -> Result<()> {
    let (dial_host, picked_subnet) = subnet::dedicated_conhost(net, peer.host.as_str()).await;

    let port = if peer.explicit_port.load(Ordering::Acquire) {
        peer.port.load(Ordering::Acquire)
    } else {
        let mux = net
            .portmux()
            .context("no explicit port and no port-mux configured")?;
        let (app, service, instance) = net.service_tuple();
        let resolved = mux
            .get(&dial_host, &app, &service, &instance)
            .with_context(|| format!("port-mux lookup for {dial_host}"))?;
        peer.port.store(i32::from(resolved), Ordering::Release);
        i32::from(resolved)
    };
    if port <= 0 {
        bail!("no usable port for {}", peer.host);
    }

    let ip = net
        .resolve_host(&dial_host)
        .await
        .with_context(|| format!("resolve {dial_host}"))?;
    let addr = std::net::SocketAddr::new(ip, port as u16);
    peer.set_addr(addr);

    let poll = Duration::from_millis(net.tuning().netpoll_ms().max(100));
    let stream = tokio::time::timeout(poll, TcpStream::connect(addr))
        .await
        .context("connect poll expired")??;
    stream.set_nodelay(true)?;
    crate::conn::set_keepalive(&stream)?;

    let mut frame = BytesMut::new();
    ConnectMsg {
        to_host: peer.host.as_str().to_string(),
        to_port: port,
        flags: 0,
        my_host: net.my_host().as_str().to_string(),
        my_port: net.connect_port_field(),
    }
    .put(&mut frame);

    let mut stream = stream;
    write_all_or_cancel(&mut stream, &frame, net.exit_token()).await?;

    install_stream(net, peer, stream, picked_subnet);
    Ok(())
}

/// Park until the reader, writer, and throttle waiters are gone, warning
/// periodically; the peer must not be unlinked under them.
async fn wait_for_drain(peer: &Arc<Peer>) {
    let mut polls = 0u32;
    while peer.has_io_tasks() || peer.throttle_waiters.load(Ordering::Acquire) > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        polls += 1;
        if polls % 10 == 0 {
            warn!(host = %peer.host, polls, "still waiting for io tasks to drain");
        }
    }
}

/// Per-task RNG; never a shared one. Seeded from pid, the current time,
/// and a stack address standing in for the task identity.
pub(crate) fn jitter_rng() -> StdRng {
    let marker = 0u8;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let mut seed_input = [0u8; 16];
    seed_input[..4].copy_from_slice(&std::process::id().to_le_bytes());
    seed_input[4..8].copy_from_slice(&nanos.to_le_bytes());
    seed_input[8..16].copy_from_slice(&(&marker as *const u8 as usize as u64).to_le_bytes());
    StdRng::seed_from_u64(u64::from(crc32c::crc32c(&seed_input)))
}
