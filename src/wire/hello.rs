// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HELLO / HELLO-REPLY payload: the sender's view of the cluster as a
//! `(host, port)` list.
//!
//! Layout: `datasz:i32, numhosts:i32, host[16]×n, port:i32×n, node:i32×n,
//! long-name runs`. `datasz` counts itself and includes 8 spare bytes per
//! host after the long runs; node numbers are written as zero and discarded
//! on read. Ports are masked to 16 bits on read.

use anyhow::{Result, bail};
use bytes::{Buf, BufMut, BytesMut};

use crate::wire::header::{HOST_FIELD_LEN, long_host_run, pack_host_field, run_to_string};

/// Sanity window for `datasz` on read.
const MIN_HELLO_SIZE: usize = 10;
const MAX_HELLO_SIZE: usize = 1024 * 1024;
/// Longest escaped hostname a hello may carry.
const MAX_HELLO_HOSTNAME: usize = 4096;

/// Encode the full hello payload for `hosts`.
pub fn encode_hostlist(hosts: &[(&str, i32)]) -> Vec<u8> {
    let numhosts = hosts.len();
    let mut runs = Vec::new();
    let mut slots = Vec::with_capacity(numhosts);
    for (host, _) in hosts {
        let mut slot = [0u8; HOST_FIELD_LEN];
        if pack_host_field(&mut slot, host) {
            runs.extend_from_slice(&long_host_run(host));
        }
        slots.push(slot);
    }

    let datasz = 4
        + 4
        + (HOST_FIELD_LEN + 4 + 4) * numhosts
        + runs.len()
        + 8 * numhosts; // spare space, kept for wire compatibility

    let mut buf = BytesMut::with_capacity(datasz);
    buf.put_i32(datasz as i32);
    buf.put_i32(numhosts as i32);
    for slot in &slots {
        buf.put_slice(slot);
    }
    for (_, port) in hosts {
        buf.put_i32(*port);
    }
    for _ in hosts {
        buf.put_i32(0); // node number, unused
    }
    buf.put_slice(&runs);
    buf.resize(datasz, 0);
    buf.to_vec()
}

/// Decode a hello payload (including its leading `datasz`) into the
/// advertised `(host, port)` list.
pub fn decode_hostlist(payload: &[u8]) -> Result<Vec<(String, i32)>> {
    let mut buf = payload;
    if buf.len() < 8 {
        bail!("hello payload too short");
    }
    let datasz = buf.get_i32();
    if (datasz as usize) < MIN_HELLO_SIZE || datasz as usize > MAX_HELLO_SIZE {
        bail!("hello datasz {datasz} out of range");
    }
    if payload.len() < datasz as usize {
        bail!("hello payload shorter than its datasz");
    }
    let numhosts = buf.get_i32();
    if numhosts < 0 {
        bail!("negative host count in hello");
    }
    let numhosts = numhosts as usize;
    if buf.remaining() < numhosts * (HOST_FIELD_LEN + 8) {
        bail!("hello payload truncated");
    }

    let mut slots = Vec::with_capacity(numhosts);
    for _ in 0..numhosts {
        let mut slot = [0u8; HOST_FIELD_LEN];
        buf.copy_to_slice(&mut slot);
        slots.push(slot);
    }
    let mut ports = Vec::with_capacity(numhosts);
    for _ in 0..numhosts {
        ports.push(buf.get_i32() & 0xffff);
    }
    for _ in 0..numhosts {
        let _node = buf.get_i32();
    }

    let mut out = Vec::with_capacity(numhosts);
    for (slot, port) in slots.iter().zip(ports) {
        let name = if slot[0] == b'.' {
            let digits = &slot[1..];
            let end = digits.iter().position(|&b| b == 0).unwrap_or(digits.len());
            let runlen: usize = std::str::from_utf8(&digits[..end])
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if runlen == 0 || runlen > MAX_HELLO_HOSTNAME {
                bail!("bad hostname run length {runlen} in hello");
            }
            if buf.remaining() < runlen {
                bail!("hello payload truncated in long names");
            }
            let mut run = vec![0u8; runlen];
            buf.copy_to_slice(&mut run);
            run_to_string(&run)?
        } else {
            run_to_string(slot)?
        };
        out.push((name, port));
    }

    Ok(out)
}
