// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-peer writer task.
//!
//! Waits for work, detaches the whole queue in one motion, and drains the
//! detached list to the buffered stream. The wire header of every entry is
//! rewritten with the current endpoints at drain time, because either port
//! may have changed since the entry was queued.

use std::{
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::BytesMut;
use tokio::{io::AsyncWriteExt, io::BufWriter, net::tcp::OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    conn::write_all_or_cancel,
    net::Net,
    peer::{IoTask, Peer},
    queue::{EnqueueFlags, QueueEntry},
    wire::header::RawWireHeader,
};

pub(crate) async fn writer_task(
    net: Arc<Net>,
    peer: Arc<Peer>,
    wr: OwnedWriteHalf,
    token: CancellationToken,
) {
    net.run_thread_start();
    let mut wr = BufWriter::with_capacity(net.tuning().bufsz(), wr);

    // membership gossip leads off every fresh link
    if let Err(e) = net.send_hello(&peer) {
        debug!(host = %peer.host, ?e, "could not queue hello");
    }

    let mut batches_since_flush = 0u32;
    let mut frame = BytesMut::new();

    loop {
        if net.is_exiting() || peer.is_closed() || token.is_cancelled() {
            break;
        }

        let batch = peer.queue.detach_all();
        if batch.is_empty() {
            if !wr.buffer().is_empty() && wr.flush().await.is_err() {
                break;
            }
            let wakeup = peer.queue.write_wakeup.notified();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::timeout(Duration::from_secs(1), wakeup) => {}
            }
            continue;
        }

        let started = Instant::now();
        let count = batch.len();
        match drain_batch(&net, &peer, batch, &mut wr, &mut frame, &token).await {
            Ok(batch_flags) => {
                let flush_now = if batch_flags.contains(EnqueueFlags::NODELAY) {
                    if let Some(delay) = net.net_delay_for(&peer.host) {
                        tokio::time::sleep(delay).await;
                    }
                    true
                } else {
                    batches_since_flush += 1;
                    batches_since_flush >= net.tuning().enque_flush_interval()
                };
                if flush_now {
                    if wr.flush().await.is_err() {
                        break;
                    }
                    peer.flushes.fetch_add(1, Ordering::Relaxed);
                    batches_since_flush = 0;
                }
            }
            Err(e) => {
                warn!(host = %peer.host, ?e, "writer io error, closing socket");
                break;
            }
        }

        let took = started.elapsed();
        if took >= Duration::from_secs(2) {
            warn!(host = %peer.host, secs = took.as_secs(), items = count, "long write");
        }
    }

    peer.close_connection();
    peer.io_task_exited(IoTask::Writer);
    net.run_thread_stop();
}

/// Write every detached entry; returns the union of their flag bits so the
/// caller can decide on the batch-end flush.
async fn drain_batch(
    net: &Net,
    peer: &Peer,
    batch: std::collections::VecDeque<QueueEntry>,
    wr: &mut BufWriter<OwnedWriteHalf>,
    frame: &mut BytesMut,
    token: &CancellationToken,
) -> Result<EnqueueFlags> {
    let myhost = net.my_host();
    let myport = net.advertised_port();
    let tohost = &peer.host;
    let toport = peer.port.load(Ordering::Acquire);
    if toport == 0 {
        warn!(host = %tohost, "peer port is zero");
    }

    let mut batch_flags = EnqueueFlags::empty();
    for entry in batch {
        batch_flags |= entry.flags;

        let mut tail = Vec::new();
        let hdr = RawWireHeader::build(
            (myhost.as_str(), myport),
            (tohost.as_str(), toport),
            entry.kind as i32,
            &mut tail,
        );
        frame.clear();
        hdr.put(&tail, frame);
        frame.extend_from_slice(&entry.payload);

        write_all_or_cancel(wr, frame, token).await?;
        peer.sends.fetch_add(1, Ordering::Relaxed);
    }
    Ok(batch_flags)
}
