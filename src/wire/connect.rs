// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connect frame: the very first bytes written on a freshly dialed
//! socket, after the single `0` marker byte.
//!
//! `my_port` may carry a child-net number stolen into bits 16..20; the
//! accept path masks it off before using the port. Bit 31 of `flags` is a
//! TLS upgrade request. Both encodings are compatibility contracts.

use anyhow::{Result, anyhow};
use bytes::{BufMut, BytesMut};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, I32, Immutable, IntoBytes, KnownLayout, U32,
};

use crate::wire::header::{
    HOST_FIELD_LEN, long_host_run, pack_host_field,
};

/// Fixed connect-frame size (the long-name runs follow it).
pub const CONNECT_MSG_LEN: usize = 48;

/// Peer requests a TLS upgrade after the connect frame.
pub const CONNECT_MSG_TLS: u32 = 0x8000_0000;
/// Mask of the child-net number stolen from `my_port`'s high bits.
pub const CONNECT_NETNUM_MASK: i32 = 0x000f_0000;
/// Mask recovering the real listener port from `my_port`.
pub const CONNECT_PORT_MASK: i32 = 0x0000_ffff;

/// Raw on-wire connect frame, bit-exact.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawConnectMsg {
    pub to_host: [u8; HOST_FIELD_LEN], // 0..16
    pub to_port: I32<BigEndian>,       // 16..20
    pub flags: U32<BigEndian>,         // 20..24, was `to_nodenum`
    pub my_host: [u8; HOST_FIELD_LEN], // 24..40
    pub my_port: I32<BigEndian>,       // 40..44
    pub my_node: I32<BigEndian>,       // 44..48, always 0
}

/// A decoded connect frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectMsg {
    pub to_host: String,
    pub to_port: i32,
    pub flags: u32,
    pub my_host: String,
    /// Raw port field, child-net bits still in place.
    pub my_port: i32,
}

impl ConnectMsg {
    /// Child-net number encoded in the port field, 0 for the parent net.
    #[inline]
    pub fn netnum(&self) -> i32 {
        (self.my_port & CONNECT_NETNUM_MASK) >> 16
    }

    /// The sender's real listener port.
    #[inline]
    pub fn sender_port(&self) -> i32 {
        self.my_port & CONNECT_PORT_MASK
    }

    #[inline]
    pub fn wants_tls(&self) -> bool {
        self.flags & CONNECT_MSG_TLS != 0
    }

    /// Serialize marker byte, fixed frame, and long-name runs
    /// (my-name first, to-name second, matching the read order).
    pub fn put(&self, buf: &mut BytesMut) {
        let mut raw = RawConnectMsg {
            to_port: I32::new(self.to_port),
            flags: U32::new(self.flags),
            my_port: I32::new(self.my_port),
            ..Default::default()
        };
        let mut my_run = None;
        let mut to_run = None;
        if pack_host_field(&mut raw.to_host, &self.to_host) {
            to_run = Some(long_host_run(&self.to_host));
        }
        if pack_host_field(&mut raw.my_host, &self.my_host) {
            my_run = Some(long_host_run(&self.my_host));
        }

        buf.put_u8(super::kind::CONNECT_FRAME);
        buf.put_slice(raw.as_bytes());
        if let Some(run) = my_run {
            buf.put_slice(&run);
        }
        if let Some(run) = to_run {
            buf.put_slice(&run);
        }
    }
}

impl RawConnectMsg {
    pub fn parse(bytes: &[u8; CONNECT_MSG_LEN]) -> Result<Self> {
        Self::read_from_bytes(bytes.as_slice())
            .map_err(|_| anyhow!("short connect frame"))
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromBytes;

    use super::*;

    #[test]
    fn fixed_size_is_bit_exact() {
        assert_eq!(std::mem::size_of::<RawConnectMsg>(), CONNECT_MSG_LEN);
    }

    #[test]
    fn netnum_rides_the_port_high_bits() {
        let msg = ConnectMsg {
            to_host: "alpha".into(),
            to_port: 9001,
            flags: 0,
            my_host: "beta".into(),
            my_port: 9002 | (3 << 16),
        };
        assert_eq!(msg.netnum(), 3);
        assert_eq!(msg.sender_port(), 9002);
        assert!(!msg.wants_tls());
    }

    #[test]
    fn marker_byte_leads_the_frame() {
        let msg = ConnectMsg {
            to_host: "alpha".into(),
            to_port: 9001,
            flags: CONNECT_MSG_TLS,
            my_host: "beta".into(),
            my_port: 9002,
        };
        let mut buf = BytesMut::new();
        msg.put(&mut buf);
        assert_eq!(buf.len(), 1 + CONNECT_MSG_LEN);
        assert_eq!(buf[0], 0);

        let raw = RawConnectMsg::read_from_bytes(&buf[1..]).expect("parse");
        assert_eq!(raw.to_port.get(), 9001);
        assert_eq!(raw.flags.get(), CONNECT_MSG_TLS);
        assert_eq!(&raw.my_host[..4], b"beta");
    }
}
