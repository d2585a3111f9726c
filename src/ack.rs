// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Request/ack correlation for fire-and-wait sends.
//!
//! Each peer keeps a small wait-list of outstanding sequence numbers. The
//! reader completes an entry when the matching ACK / ACK_PAYLOAD frame
//! arrives and broadcasts the peer's ack wakeup; the sender side waits with
//! a deadline. Outstanding acks per peer stay in the single digits, so a
//! plain Vec beats a map here.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use zerocopy::{I32, IntoBytes};

use crate::{
    error::{SendError, SendResult},
    intern::HostRef,
    net::Net,
    peer::Peer,
    queue::EnqueueFlags,
    wire::{
        kind::WireKind,
        user::{AckMsg, AckPayloadHeader, MAX_ACK_PAYLOAD},
    },
};

/// One outstanding fire-and-wait send.
#[derive(Debug)]
pub struct AckWait {
    pub seqnum: i32,
    pub done: bool,
    pub outrc: i32,
    pub payload: Option<Vec<u8>>,
    pub created: Instant,
}

/// What the waiter gets back on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub rc: i32,
    pub payload: Option<Vec<u8>>,
}

/// Register an empty wait-list entry for `seqnum`.
pub(crate) fn register_wait(peer: &Peer, seqnum: i32) {
    waits_guard(peer).push(AckWait {
        seqnum,
        done: false,
        outrc: 0,
        payload: None,
        created: Instant::now(),
    });
}

/// Complete the entry for `seqnum` and wake every waiter on this peer.
/// Returns false when no such entry exists (late or duplicate ack).
pub(crate) fn complete_wait(
    peer: &Peer,
    seqnum: i32,
    outrc: i32,
    payload: Option<Vec<u8>>,
) -> bool {
    let mut waits = waits_guard(peer);
    let Some(entry) = waits.iter_mut().find(|w| w.seqnum == seqnum) else {
        return false;
    };
    entry.done = true;
    entry.outrc = outrc;
    entry.payload = payload;
    drop(waits);
    peer.ack_wakeup.notify_waiters();
    true
}

pub(crate) fn remove_wait(peer: &Peer, seqnum: i32) -> Option<AckWait> {
    let mut waits = waits_guard(peer);
    let idx = waits.iter().position(|w| w.seqnum == seqnum)?;
    Some(waits.swap_remove(idx))
}

/// Park until the entry completes or the deadline passes. The entry is
/// removed on every exit path; a reply landing after a timeout finds
/// nothing and is dropped.
pub(crate) async fn wait_for_ack(
    peer: &Peer,
    seqnum: i32,
    wait: Duration,
) -> SendResult<AckOutcome> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let wakeup = peer.ack_wakeup.notified();
        {
            let mut waits = waits_guard(peer);
            if let Some(idx) = waits.iter().position(|w| w.seqnum == seqnum && w.done) {
                let entry = waits.swap_remove(idx);
                if entry.outrc < 0 {
                    return Err(SendError::InvalidAckRc);
                }
                return Ok(AckOutcome {
                    rc: entry.outrc,
                    payload: entry.payload,
                });
            }
        }
        if tokio::time::timeout_at(deadline, wakeup).await.is_err() {
            remove_wait(peer, seqnum);
            return Err(SendError::Timeout);
        }
    }
}

fn waits_guard(peer: &Peer) -> std::sync::MutexGuard<'_, Vec<AckWait>> {
    match peer.waits.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Handed to a user handler whose sender asked for an ack; lets the handler
/// reply once, with or without a payload, long after it returned.
#[derive(Clone)]
pub struct AckState {
    net: Arc<Net>,
    from: HostRef,
    seqnum: i32,
    needack: bool,
}

impl AckState {
    pub(crate) fn new(net: Arc<Net>, from: HostRef, seqnum: i32, needack: bool) -> Self {
        Self {
            net,
            from,
            seqnum,
            needack,
        }
    }

    #[inline]
    pub fn needs_ack(&self) -> bool {
        self.needack
    }

    #[inline]
    pub fn from_host(&self) -> &HostRef {
        &self.from
    }

    /// Send a bare ACK carrying `rc` back to the requester.
    pub fn ack(&self, rc: i32) -> SendResult<()> {
        if !self.needack {
            return Ok(());
        }
        let msg = AckMsg {
            seqnum: I32::new(self.seqnum),
            outrc: I32::new(rc),
        };
        self.net.enqueue_control(
            &self.from,
            WireKind::Ack,
            msg.as_bytes(),
            EnqueueFlags::NODELAY | EnqueueFlags::NO_HELLO_CHECK,
        )
    }

    /// Send an ACK_PAYLOAD carrying `rc` plus up to 1 KiB of reply bytes.
    pub fn ack_payload(&self, rc: i32, payload: &[u8]) -> SendResult<()> {
        if !self.needack {
            return Ok(());
        }
        if payload.is_empty() || payload.len() > MAX_ACK_PAYLOAD {
            return Err(SendError::Internal);
        }
        let hdr = AckPayloadHeader {
            seqnum: I32::new(self.seqnum),
            outrc: I32::new(rc),
            paylen: I32::new(payload.len() as i32),
        };
        let mut body = Vec::with_capacity(hdr.as_bytes().len() + payload.len());
        body.extend_from_slice(hdr.as_bytes());
        body.extend_from_slice(payload);
        self.net.enqueue_control(
            &self.from,
            WireKind::AckPayload,
            &body,
            EnqueueFlags::NODELAY | EnqueueFlags::NO_HELLO_CHECK,
        )
    }
}

impl std::fmt::Debug for AckState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckState")
            .field("from", &self.from)
            .field("seqnum", &self.seqnum)
            .field("needack", &self.needack)
            .finish()
    }
}
