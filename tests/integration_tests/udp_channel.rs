// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use tokio::{net::UdpSocket, time::timeout};

use crate::integration_tests::common::{hello_done, start_net, wait_until};

const NODE_A: &str = "udp-node-a";
const NODE_B: &str = "udp-node-b";
const ALL: &[&str] = &[NODE_A, NODE_B];

/// The datagram path reuses the directory's cached peer address; no
/// framing, no retransmit, just counters.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn datagrams_reach_the_cached_peer_address() -> Result<()> {
    let b = start_net(NODE_B, ALL, &[], |_| {}).await?;
    let a = start_net(NODE_A, ALL, &[(NODE_B, b.advertised_port())], |_| {}).await?;

    // the connector caches b's address while dialing
    assert!(wait_until(Duration::from_secs(5), || hello_done(&a, NODE_B)).await);

    // listen on the same port number as b's TCP listener, UDP side
    let b_sock = UdpSocket::bind(("127.0.0.1", b.advertised_port() as u16)).await?;
    let a_sock = UdpSocket::bind("127.0.0.1:0").await?;

    let sent = a.udp_send(&a_sock, NODE_B, b"datagram").await.expect("udp send");
    assert_eq!(sent, 8);

    let mut buf = [0u8; 64];
    let (n, _) = timeout(Duration::from_secs(2), b_sock.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..n], b"datagram");
    b.udp_note_recv(NODE_A);

    let peer = a.directory().lookup_name(NODE_B).expect("peer");
    assert_eq!(peer.udp_sent.load(std::sync::atomic::Ordering::Relaxed), 1);

    a.shutdown();
    b.shutdown();
    Ok(())
}
