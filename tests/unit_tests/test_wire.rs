// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::BytesMut;
use hex::FromHex;
use netbus::wire::{
    connect::{CONNECT_MSG_LEN, ConnectMsg},
    header::{
        HOST_FIELD_LEN, HostField, RawWireHeader, WIRE_HEADER_LEN, long_host_run,
        pack_host_field, parse_host_field,
    },
    hello::{decode_hostlist, encode_hostlist},
    kind::WireKind,
};

fn from_hex(s: &str) -> Result<Vec<u8>> {
    let cleaned = s.replace(|c: char| c.is_whitespace(), "");
    Ok(Vec::from_hex(cleaned)?)
}

/// The header layout is the compatibility contract; pin it to golden bytes.
#[test]
fn wire_header_golden_frame() -> Result<()> {
    let golden = from_hex(
        "616c7068610000000000000000000000 00002329 00000000 \
         62657461000000000000000000000000 0000232a 00000000 \
         00000005",
    )?;
    assert_eq!(golden.len(), WIRE_HEADER_LEN);

    let mut tail = Vec::new();
    let hdr = RawWireHeader::build(
        ("alpha", 9001),
        ("beta", 9002),
        WireKind::UserMsg as i32,
        &mut tail,
    );
    assert!(tail.is_empty());

    let mut buf = BytesMut::new();
    hdr.put(&tail, &mut buf);
    assert_eq!(&buf[..], &golden[..]);

    let mut raw = [0u8; WIRE_HEADER_LEN];
    raw.copy_from_slice(&golden);
    let parsed = RawWireHeader::parse(&raw)?;
    assert_eq!(parsed.fromport.get(), 9001);
    assert_eq!(parsed.toport.get(), 9002);
    assert_eq!(parsed.kind.get(), WireKind::UserMsg as i32);
    Ok(())
}

#[test]
fn connect_frame_golden_bytes() -> Result<()> {
    let golden = from_hex(
        "00 \
         62657461000000000000000000000000 0000232a 00000000 \
         616c7068610000000000000000000000 00002329 00000000",
    )?;
    assert_eq!(golden.len(), 1 + CONNECT_MSG_LEN);

    let msg = ConnectMsg {
        to_host: "beta".into(),
        to_port: 9002,
        flags: 0,
        my_host: "alpha".into(),
        my_port: 9001,
    };
    let mut buf = BytesMut::new();
    msg.put(&mut buf);
    assert_eq!(&buf[..], &golden[..]);
    Ok(())
}

#[test]
fn hostname_boundary_15_inline_16_escape() -> Result<()> {
    // 15 characters: last inline length
    let name15 = "123456789012345";
    let mut slot = [0u8; HOST_FIELD_LEN];
    assert!(!pack_host_field(&mut slot, name15));
    assert_eq!(parse_host_field(&slot)?, HostField::Inline(name15.into()));

    // 16 characters: first escaped length; the run counts the NUL
    let name16 = "1234567890123456";
    assert!(pack_host_field(&mut slot, name16));
    assert_eq!(&slot[..3], b".17");
    assert_eq!(parse_host_field(&slot)?, HostField::Long(17));
    assert_eq!(long_host_run(name16).len(), 17);
    Ok(())
}

#[test]
fn both_endpoints_may_be_long_independently() {
    let long_from = "from-host-longer-than-the-slot.example.com";
    let short_to = "beta";

    let mut tail = Vec::new();
    let hdr = RawWireHeader::build((long_from, 9001), (short_to, 9002), 1, &mut tail);
    assert_eq!(hdr.fromhost[0], b'.');
    assert_ne!(hdr.tohost[0], b'.');
    // only the from-run follows the header
    assert_eq!(tail.len(), long_from.len() + 1);
}

#[test]
fn hello_payload_round_trips_with_mixed_names() -> Result<()> {
    let long = "gossip-host-longer-than-sixteen.example.com";
    let hosts = vec![("alpha", 9001), (long, 9002), ("gamma", 9003)];
    let payload = encode_hostlist(&hosts);
    let decoded = decode_hostlist(&payload)?;
    assert_eq!(
        decoded,
        vec![
            ("alpha".to_string(), 9001),
            (long.to_string(), 9002),
            ("gamma".to_string(), 9003),
        ]
    );
    Ok(())
}

#[test]
fn hello_with_only_known_hosts_adds_nothing_new() -> Result<()> {
    // A receiver holding the same set derives no new members from it.
    let hosts = vec![("alpha", 9001), ("beta", 9002)];
    let payload = encode_hostlist(&hosts);
    let decoded = decode_hostlist(&payload)?;
    let known: std::collections::HashSet<_> =
        hosts.iter().map(|(h, _)| h.to_string()).collect();
    assert!(decoded.iter().all(|(h, _)| known.contains(h)));
    Ok(())
}
