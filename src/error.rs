// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Outcome codes surfaced to senders.
///
/// Every failure a producer can see maps to one of these variants; IO
/// failures inside the reader/writer tasks are never surfaced here, they
/// tear down the affected socket instead.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Destination host is not present in the peer directory.
    #[error("destination host is not in the directory")]
    InvalidNode,
    /// The destination is this node itself.
    #[error("message addressed to myself")]
    SendToMe,
    /// No socket is currently established to the destination.
    #[error("no socket to destination")]
    NoSock,
    /// The peer is closed and drains no new enqueues.
    #[error("destination is closed")]
    Closed,
    /// No HELLO / HELLO-REPLY has been consumed from the peer yet.
    #[error("no hello from destination yet")]
    NoHelloYet,
    /// Per-peer queue count or byte cap exceeded.
    #[error("per-peer send queue is full")]
    QueueFull,
    /// The queue entry's payload reservation failed.
    #[error("failed to reserve memory for the queue entry")]
    MallocFail,
    /// The enqueue failed after the ack waiter was already registered.
    #[error("enqueue failed for an ack-bearing message")]
    WriteFail,
    /// The ack deadline elapsed without a reply.
    #[error("timed out waiting for ack")]
    Timeout,
    /// The remote handler produced a negative ack code.
    #[error("remote handler returned an invalid (negative) ack code")]
    InvalidAckRc,
    /// Catch-all for states that should not be reachable.
    #[error("internal error")]
    Internal,
}

impl SendError {
    /// Stable numeric code for callers that speak integers.
    ///
    /// `NoHelloYet` is pinned at -9; the rest are distinct negatives kept
    /// stable across releases.
    pub const fn code(self) -> i32 {
        match self {
            SendError::Internal => -1,
            SendError::InvalidNode => -2,
            SendError::SendToMe => -3,
            SendError::NoSock => -4,
            SendError::Closed => -5,
            SendError::QueueFull => -6,
            SendError::MallocFail => -7,
            SendError::WriteFail => -8,
            SendError::NoHelloYet => -9,
            SendError::Timeout => -10,
            SendError::InvalidAckRc => -11,
        }
    }
}

pub type SendResult<T> = std::result::Result<T, SendError>;
