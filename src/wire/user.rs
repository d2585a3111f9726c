// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Payload prefixes for user messages and the two ack frame shapes.

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, I32, Immutable, IntoBytes, KnownLayout,
};

/// Largest payload an ACK_PAYLOAD frame may carry.
pub const MAX_ACK_PAYLOAD: usize = 1024;

pub const USER_MSG_HEADER_LEN: usize = 16;
pub const ACK_LEN: usize = 8;
pub const ACK_PAYLOAD_HEADER_LEN: usize = 12;

/// Prefix of every USER_MSG payload.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct UserMsgHeader {
    pub usertype: I32<BigEndian>,
    pub seqnum: I32<BigEndian>,
    pub waitforack: I32<BigEndian>,
    pub datalen: I32<BigEndian>,
}

impl UserMsgHeader {
    pub fn new(usertype: i32, seqnum: i32, waitforack: bool, datalen: i32) -> Self {
        Self {
            usertype: I32::new(usertype),
            seqnum: I32::new(seqnum),
            waitforack: I32::new(waitforack as i32),
            datalen: I32::new(datalen),
        }
    }

    pub fn parse(bytes: &[u8; USER_MSG_HEADER_LEN]) -> Result<Self> {
        Self::read_from_bytes(bytes.as_slice())
            .map_err(|_| anyhow!("short user message header"))
    }
}

/// Body of an ACK frame.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AckMsg {
    pub seqnum: I32<BigEndian>,
    pub outrc: I32<BigEndian>,
}

impl AckMsg {
    pub fn parse(bytes: &[u8; ACK_LEN]) -> Result<Self> {
        Self::read_from_bytes(bytes.as_slice()).map_err(|_| anyhow!("short ack"))
    }
}

/// Fixed prefix of an ACK_PAYLOAD frame; `paylen` bytes follow.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AckPayloadHeader {
    pub seqnum: I32<BigEndian>,
    pub outrc: I32<BigEndian>,
    pub paylen: I32<BigEndian>,
}

impl AckPayloadHeader {
    /// Parse and validate: `paylen` outside `[1, 1024]` marks the frame
    /// malformed and the connection is dropped by the caller.
    pub fn parse(bytes: &[u8; ACK_PAYLOAD_HEADER_LEN]) -> Result<Self> {
        let hdr = Self::read_from_bytes(bytes.as_slice())
            .map_err(|_| anyhow!("short payload ack header"))?;
        let paylen = hdr.paylen.get();
        if paylen < 1 || paylen as usize > MAX_ACK_PAYLOAD {
            bail!("impossible ack payload length {paylen}");
        }
        Ok(hdr)
    }
}
