// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The `type` discriminator carried by every wire header.
//!
//! Type `0` never appears inside a wire header: it is the first byte of a
//! freshly opened socket and marks the connect frame (see
//! [`crate::wire::connect`]). Value `4` is retired and must stay unused.

use std::convert::TryFrom;

use thiserror::Error;

/// First-byte marker for the connect frame on a new socket.
pub const CONNECT_FRAME: u8 = 0;

/// Message kinds understood by the reader dispatch table.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Heartbeat = 1,
    Hello = 2,
    /// Legacy numeric-node decommission notice; parsed but never emitted.
    Decom = 3,
    UserMsg = 5,
    Ack = 6,
    HelloReply = 7,
    DecomName = 8,
    AckPayload = 9,
}

impl WireKind {
    #[inline]
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => Self::Heartbeat,
            2 => Self::Hello,
            3 => Self::Decom,
            5 => Self::UserMsg,
            6 => Self::Ack,
            7 => Self::HelloReply,
            8 => Self::DecomName,
            9 => Self::AckPayload,
            _ => return None,
        })
    }
}

/// Returned when the header's type field holds an undefined value.
#[derive(Debug, Error)]
#[error("unknown wire message type: {0}")]
pub struct UnknownWireKind(pub i32);

impl TryFrom<i32> for WireKind {
    type Error = UnknownWireKind;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Self::from_i32(v).ok_or(UnknownWireKind(v))
    }
}
