// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bounded per-peer send queue.
//!
//! Entries wait here until the peer's writer task detaches the whole list
//! and drains it to the socket. The wire header is rewritten at drain time,
//! so an entry only records its kind and body.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use bitflags::bitflags;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::info;

use crate::{
    error::{SendError, SendResult},
    wire::{header::WIRE_HEADER_LEN, kind::WireKind},
};

bitflags! {
    /// Caller-supplied enqueue policy bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnqueueFlags: u32 {
        /// Signal the writer after enqueue and flush at batch end.
        const NODELAY = 1 << 0;
        /// Bypass the count and byte caps.
        const NOLIMIT = 1 << 1;
        /// Drop the new entry if the current head has the same kind.
        const NODUPE = 1 << 2;
        /// Insert at the head instead of the tail.
        const HEAD = 1 << 3;
        /// Insertion-sort into the tail window using the net comparator.
        const INORDER = 1 << 4;
        /// Skip the got-hello gate (hellos, heartbeats, acks, decom).
        const NO_HELLO_CHECK = 1 << 5;
    }
}

/// One queued frame: kind plus everything that follows the wire header.
#[derive(Debug)]
pub struct QueueEntry {
    pub flags: EnqueueFlags,
    pub enque_time: Instant,
    pub kind: WireKind,
    pub payload: Bytes,
}

impl QueueEntry {
    /// Accounted length: fixed header plus body.
    #[inline]
    pub fn wire_len(&self) -> u64 {
        (WIRE_HEADER_LEN + self.payload.len()) as u64
    }
}

/// Comparator used by `INORDER`; receives the two frame bodies.
pub type NetCmp = dyn Fn(&[u8], &[u8]) -> std::cmp::Ordering + Send + Sync;

#[derive(Debug, Default)]
struct QueueInner {
    entries: VecDeque<QueueEntry>,
    enque_count: usize,
    enque_bytes: u64,
    dedupe_count: u64,
    reorder_count: u64,
    num_queue_full: u64,
    last_full_dump: Option<Instant>,
}

/// Counter snapshot for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub enque_count: usize,
    pub enque_bytes: u64,
    pub dedupe_count: u64,
    pub reorder_count: u64,
    pub num_queue_full: u64,
}

/// Caps and knobs the owner reads from its live config at each call.
#[derive(Debug, Clone, Copy)]
pub struct QueueCaps {
    pub max_queue: usize,
    pub max_bytes: u64,
    pub reorder_lookahead: usize,
    pub dump_on_full: bool,
}

pub struct SendQueue {
    inner: Mutex<QueueInner>,
    /// Kicked after a NODELAY enqueue; the writer waits on this.
    pub write_wakeup: Notify,
    /// Broadcast by the writer after detaching the queue.
    pub throttle_wakeup: Notify,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            write_wakeup: Notify::new(),
            throttle_wakeup: Notify::new(),
        }
    }

    /// Append under the queue's own lock, honoring the policy bits.
    ///
    /// One message always slips in when the queue is empty, even past the
    /// byte cap. A dedupe is a success: the frame most recently offered is
    /// the one the wire does not need twice.
    pub fn enqueue(
        &self,
        entry: QueueEntry,
        caps: QueueCaps,
        netcmp: Option<&NetCmp>,
        host: &str,
    ) -> SendResult<()> {
        let mut q = self.locked();

        if q.enque_count != 0
            && !entry.flags.contains(EnqueueFlags::NOLIMIT)
            && (q.enque_count >= caps.max_queue || q.enque_bytes > caps.max_bytes)
        {
            q.num_queue_full += 1;
            if caps.dump_on_full {
                Self::dump_full_queue(&mut q, host);
            }
            return Err(SendError::QueueFull);
        }

        if entry.flags.contains(EnqueueFlags::NODUPE)
            && q.entries.front().map(|head| head.kind) == Some(entry.kind)
        {
            q.dedupe_count += 1;
            return Ok(());
        }

        let len = entry.wire_len();
        let nodelay = entry.flags.contains(EnqueueFlags::NODELAY);

        if q.entries.is_empty() || entry.flags.contains(EnqueueFlags::HEAD) {
            q.entries.push_front(entry);
        } else if entry.flags.contains(EnqueueFlags::INORDER)
            && let Some(cmp) = netcmp
        {
            let mut idx = q.entries.len();
            let mut steps = 0usize;
            let mut moved = false;
            while idx > 0
                && steps < caps.reorder_lookahead
                && cmp(&entry.payload, &q.entries[idx - 1].payload)
                    == std::cmp::Ordering::Less
            {
                idx -= 1;
                steps += 1;
                moved = true;
            }
            if moved {
                q.reorder_count += 1;
            }
            q.entries.insert(idx, entry);
        } else {
            q.entries.push_back(entry);
        }

        q.enque_count += 1;
        q.enque_bytes += len;
        drop(q);

        if nodelay {
            self.write_wakeup.notify_one();
        }
        Ok(())
    }

    /// Detach the entire list, resetting the counters. The caller owns the
    /// result; nothing else will ever see those entries again.
    pub fn detach_all(&self) -> VecDeque<QueueEntry> {
        let detached = {
            let mut q = self.locked();
            q.enque_count = 0;
            q.enque_bytes = 0;
            std::mem::take(&mut q.entries)
        };
        self.throttle_wakeup.notify_waiters();
        detached
    }

    /// Drop everything still queued (peer teardown).
    pub fn purge(&self) {
        self.detach_all();
    }

    pub fn stats(&self) -> QueueStats {
        let q = self.locked();
        QueueStats {
            enque_count: q.enque_count,
            enque_bytes: q.enque_bytes,
            dedupe_count: q.dedupe_count,
            reorder_count: q.reorder_count,
            num_queue_full: q.num_queue_full,
        }
    }

    #[inline]
    pub fn depth(&self) -> (usize, u64) {
        let q = self.locked();
        (q.enque_count, q.enque_bytes)
    }

    /// Block the producer while the queue sits above `pct` percent of either
    /// cap; the writer's post-drain broadcast wakes us up.
    pub async fn throttle_wait(&self, pct: u32, caps: QueueCaps) {
        loop {
            let wakeup = self.throttle_wakeup.notified();
            {
                let q = self.locked();
                let count_limit = caps.max_queue.saturating_mul(pct as usize) / 100;
                let bytes_limit = caps.max_bytes.saturating_mul(u64::from(pct)) / 100;
                if q.enque_count <= count_limit && q.enque_bytes <= bytes_limit {
                    return;
                }
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), wakeup).await;
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Histogram of queued kinds, logged at most once per second.
    fn dump_full_queue(q: &mut QueueInner, host: &str) {
        let now = Instant::now();
        if let Some(last) = q.last_full_dump
            && now.duration_since(last) < Duration::from_secs(1)
        {
            return;
        }
        q.last_full_dump = Some(now);

        let mut counts: [u64; 10] = [0; 10];
        for e in &q.entries {
            counts[(e.kind as usize).min(9)] += 1;
        }
        info!(
            host,
            count = q.enque_count,
            bytes = q.enque_bytes,
            heartbeat = counts[WireKind::Heartbeat as usize],
            hello = counts[WireKind::Hello as usize],
            user = counts[WireKind::UserMsg as usize],
            ack = counts[WireKind::Ack as usize],
            "send queue full"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(max_queue: usize, max_bytes: u64) -> QueueCaps {
        QueueCaps {
            max_queue,
            max_bytes,
            reorder_lookahead: 5,
            dump_on_full: false,
        }
    }

    fn entry(kind: WireKind, body: &[u8], flags: EnqueueFlags) -> QueueEntry {
        QueueEntry {
            flags,
            enque_time: Instant::now(),
            kind,
            payload: Bytes::copy_from_slice(body),
        }
    }

    #[test]
    fn byte_accounting_matches_entries() {
        let q = SendQueue::new();
        for body in [&b"ab"[..], &b"cdef"[..]] {
            q.enqueue(
                entry(WireKind::UserMsg, body, EnqueueFlags::empty()),
                caps(100, 1 << 20),
                None,
                "peer",
            )
            .expect("enqueue");
        }
        let detached = q.detach_all();
        let total: u64 = detached.iter().map(QueueEntry::wire_len).sum();
        assert_eq!(total, (2 * WIRE_HEADER_LEN + 6) as u64);
        assert_eq!(q.depth(), (0, 0));
    }

    #[test]
    fn full_at_cap_rejected_below_cap_admitted() {
        let q = SendQueue::new();
        let c = caps(3, 1 << 20);
        for _ in 0..3 {
            q.enqueue(
                entry(WireKind::UserMsg, b"x", EnqueueFlags::empty()),
                c,
                None,
                "peer",
            )
            .expect("under cap");
        }
        let err = q
            .enqueue(
                entry(WireKind::UserMsg, b"x", EnqueueFlags::empty()),
                c,
                None,
                "peer",
            )
            .expect_err("at cap");
        assert_eq!(err, SendError::QueueFull);
        assert_eq!(q.stats().num_queue_full, 1);
    }

    #[test]
    fn first_entry_ignores_the_byte_cap() {
        let q = SendQueue::new();
        q.enqueue(
            entry(WireKind::UserMsg, &[0u8; 4096], EnqueueFlags::empty()),
            caps(10, 16),
            None,
            "peer",
        )
        .expect("empty queue always admits");
    }

    #[test]
    fn nolimit_bypasses_caps() {
        let q = SendQueue::new();
        let c = caps(1, 1);
        q.enqueue(
            entry(WireKind::UserMsg, b"x", EnqueueFlags::empty()),
            c,
            None,
            "peer",
        )
        .expect("first");
        q.enqueue(
            entry(WireKind::Heartbeat, b"", EnqueueFlags::NOLIMIT),
            c,
            None,
            "peer",
        )
        .expect("nolimit");
    }

    #[test]
    fn nodupe_drops_same_kind_head() {
        let q = SendQueue::new();
        let c = caps(100, 1 << 20);
        let hb = EnqueueFlags::HEAD | EnqueueFlags::NODUPE | EnqueueFlags::NOLIMIT;
        for _ in 0..50 {
            q.enqueue(entry(WireKind::Heartbeat, b"", hb), c, None, "peer")
                .expect("heartbeat");
        }
        assert_eq!(q.depth().0, 1);
        assert_eq!(q.stats().dedupe_count, 49);
    }

    #[test]
    fn head_inserts_in_front() {
        let q = SendQueue::new();
        let c = caps(100, 1 << 20);
        q.enqueue(entry(WireKind::UserMsg, b"bulk", EnqueueFlags::empty()), c, None, "p")
            .expect("bulk");
        q.enqueue(entry(WireKind::Heartbeat, b"", EnqueueFlags::HEAD), c, None, "p")
            .expect("head");
        let drained = q.detach_all();
        assert_eq!(drained[0].kind, WireKind::Heartbeat);
        assert_eq!(drained[1].kind, WireKind::UserMsg);
    }

    #[test]
    fn inorder_sorts_within_the_window() {
        let q = SendQueue::new();
        let c = caps(100, 1 << 20);
        let cmp = |a: &[u8], b: &[u8]| a.cmp(b);
        for body in [b"e", b"d", b"c", b"b", b"a"] {
            q.enqueue(
                entry(WireKind::UserMsg, body, EnqueueFlags::INORDER),
                c,
                Some(&cmp),
                "p",
            )
            .expect("inorder");
        }
        let drained: Vec<_> = q
            .detach_all()
            .into_iter()
            .map(|e| e.payload[0])
            .collect();
        assert_eq!(drained, b"abcde".to_vec());
    }

    #[test]
    fn inorder_window_is_bounded() {
        let q = SendQueue::new();
        let c = caps(100, 1 << 20);
        let cmp = |a: &[u8], b: &[u8]| a.cmp(b);
        for body in [&b"z"[..], b"y", b"x", b"w", b"v", b"u"] {
            q.enqueue(
                entry(WireKind::UserMsg, body, EnqueueFlags::INORDER),
                c,
                Some(&cmp),
                "p",
            )
            .expect("inorder");
        }
        let drained: Vec<_> = q
            .detach_all()
            .into_iter()
            .map(|e| e.payload[0])
            .collect();
        // "u" walked back its full 5-slot window, the rest stayed sorted.
        assert_eq!(drained, b"uvwxyz".to_vec());
    }
}
