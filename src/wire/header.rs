// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The fixed wire header that starts every frame.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! fromhost[16]  fromport:i32  fromnode:i32(=0)
//! tohost[16]    toport:i32    tonode:i32(=0)
//! type:i32
//! ```
//!
//! A hostname that does not fit the 16-byte slot (15 usable characters plus
//! NUL) is replaced by the escape `"." <decimal length>` and the real name
//! follows the fixed header as a raw byte run, from-name first, to-name
//! second. The run length counts the trailing NUL, so a name of character
//! length `L` escapes to `".{L+1}"` with an `L+1`-byte run. This layout is
//! the compatibility contract; never widen the header instead.

use anyhow::{Result, anyhow, bail};
use bytes::{BufMut, BytesMut};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, I32, Immutable, IntoBytes, KnownLayout,
};

/// Inline hostname slot width.
pub const HOST_FIELD_LEN: usize = 16;
/// Total size of the fixed header on the wire.
pub const WIRE_HEADER_LEN: usize = 52;
/// Longest hostname the escape form accepts (run length, NUL included).
pub const MAX_HOSTNAME_RUN: usize = 256;

/// Raw on-wire header, bit-exact.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawWireHeader {
    pub fromhost: [u8; HOST_FIELD_LEN], // 0..16
    pub fromport: I32<BigEndian>,       // 16..20
    pub fromnode: I32<BigEndian>,       // 20..24, always 0
    pub tohost: [u8; HOST_FIELD_LEN],   // 24..40
    pub toport: I32<BigEndian>,         // 40..44
    pub tonode: I32<BigEndian>,         // 44..48, always 0
    pub kind: I32<BigEndian>,           // 48..52
}

/// Result of looking at one 16-byte host slot.
#[derive(Debug, PartialEq, Eq)]
pub enum HostField {
    /// The name was inline; decoded and NUL-stripped.
    Inline(String),
    /// Escape form: this many bytes (NUL included) follow the fixed header.
    Long(usize),
}

/// Fill one host slot; returns true when the caller must append the long run.
pub fn pack_host_field(slot: &mut [u8; HOST_FIELD_LEN], name: &str) -> bool {
    slot.fill(0);
    let bytes = name.as_bytes();
    if bytes.len() < HOST_FIELD_LEN {
        slot[..bytes.len()].copy_from_slice(bytes);
        false
    } else {
        let escape = format!(".{}", bytes.len() + 1);
        slot[..escape.len()].copy_from_slice(escape.as_bytes());
        true
    }
}

/// The byte run appended after the fixed header for an escaped name.
pub fn long_host_run(name: &str) -> Vec<u8> {
    let mut run = Vec::with_capacity(name.len() + 1);
    run.extend_from_slice(name.as_bytes());
    run.push(0);
    run
}

/// Parse one host slot into its inline name or the pending run length.
pub fn parse_host_field(slot: &[u8; HOST_FIELD_LEN]) -> Result<HostField> {
    if slot[0] == b'.' {
        let digits = &slot[1..HOST_FIELD_LEN - 1];
        let end = digits.iter().position(|&b| b == 0).unwrap_or(digits.len());
        let runlen: usize = std::str::from_utf8(&digits[..end])
            .map_err(|_| anyhow!("malformed hostname length escape"))?
            .parse()
            .map_err(|_| anyhow!("malformed hostname length escape"))?;
        if runlen < 1 || runlen > MAX_HOSTNAME_RUN {
            bail!("impossible hostname run length {runlen}");
        }
        Ok(HostField::Long(runlen))
    } else {
        Ok(HostField::Inline(inline_to_string(slot)?))
    }
}

/// Decode a NUL-padded byte run (inline slot or long run) into a name.
pub fn run_to_string(run: &[u8]) -> Result<String> {
    let end = run.iter().position(|&b| b == 0).unwrap_or(run.len());
    let name = std::str::from_utf8(&run[..end])
        .map_err(|_| anyhow!("hostname is not valid utf-8"))?;
    if name.is_empty() {
        bail!("empty hostname on the wire");
    }
    Ok(name.to_string())
}

fn inline_to_string(slot: &[u8; HOST_FIELD_LEN]) -> Result<String> {
    run_to_string(slot)
}

impl RawWireHeader {
    /// Build a header for `kind`, packing both endpoints; long runs for the
    /// escaped names are appended to `tail` in from-then-to order.
    pub fn build(
        from: (&str, i32),
        to: (&str, i32),
        kind: i32,
        tail: &mut Vec<u8>,
    ) -> Self {
        let mut hdr = RawWireHeader {
            fromport: I32::new(from.1),
            toport: I32::new(to.1),
            kind: I32::new(kind),
            ..Default::default()
        };
        if pack_host_field(&mut hdr.fromhost, from.0) {
            tail.extend_from_slice(&long_host_run(from.0));
        }
        if pack_host_field(&mut hdr.tohost, to.0) {
            tail.extend_from_slice(&long_host_run(to.0));
        }
        hdr
    }

    /// Serialize header plus long-name tail into `buf`.
    pub fn put(&self, tail: &[u8], buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
        buf.put_slice(tail);
    }

    pub fn parse(bytes: &[u8; WIRE_HEADER_LEN]) -> Result<Self> {
        Self::read_from_bytes(bytes.as_slice())
            .map_err(|_| anyhow!("short wire header"))
    }
}

/// Fully decoded header, long names resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeader {
    pub from_host: String,
    pub from_port: i32,
    pub to_host: String,
    pub to_port: i32,
    pub kind: i32,
}
