// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use serial_test::serial;
use tokio::time::Instant;

use netbus::error::SendError;

use crate::integration_tests::common::{hello_done, start_net, wait_until};

const NODE_A: &str = "rpc-node-a";
const NODE_B: &str = "rpc-node-b";
const ALL: &[&str] = &[NODE_A, NODE_B];

const PING_TYPE: usize = 7;
const SILENT_TYPE: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn payload_ack_round_trip_and_timeout() -> Result<()> {
    let b = start_net(NODE_B, ALL, &[], |_| {}).await?;
    let a = start_net(NODE_A, ALL, &[(NODE_B, b.advertised_port())], |_| {}).await?;

    b.register_user_handler(
        PING_TYPE,
        "ping",
        Arc::new(|ack, data| {
            assert_eq!(data, &b"ping"[..]);
            let _ = ack.ack_payload(0, b"pong");
        }),
    )?;
    b.register_user_handler(SILENT_TYPE, "silent", Arc::new(|_, _| {}))?;

    assert!(wait_until(Duration::from_secs(5), || hello_done(&a, NODE_B)).await);
    assert!(wait_until(Duration::from_secs(5), || hello_done(&b, NODE_A)).await);

    // handler acks: rc and payload come back
    let out = a
        .send_message_payload_ack(NODE_B, PING_TYPE as i32, b"ping", Duration::from_secs(1))
        .await
        .expect("acked rpc");
    assert_eq!(out.rc, 0);
    assert_eq!(out.payload.as_deref(), Some(&b"pong"[..]));

    // handler never acks: the deadline fires at roughly the wait time
    let started = Instant::now();
    let err = a
        .send_message_payload_ack(
            NODE_B,
            SILENT_TYPE as i32,
            b"ping",
            Duration::from_millis(1000),
        )
        .await
        .expect_err("no ack coming");
    assert_eq!(err, SendError::Timeout);
    let waited = started.elapsed();
    assert!(
        waited >= Duration::from_millis(900) && waited < Duration::from_secs(3),
        "timeout fired at {waited:?}"
    );

    a.shutdown();
    b.shutdown();
    Ok(())
}

/// User messages are refused until gossip completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn user_send_gated_on_hello() -> Result<()> {
    let b = start_net("gate-node-b", &["gate-node-a", "gate-node-b"], &[], |_| {}).await?;
    let a = start_net(
        "gate-node-a",
        &["gate-node-a", "gate-node-b"],
        &[("gate-node-b", b.advertised_port())],
        |_| {},
    )
    .await?;

    // wait only for the socket, not the gossip
    assert!(
        wait_until(Duration::from_secs(5), || {
            a.directory()
                .lookup_name("gate-node-b")
                .map(|p| p.is_connected())
                .unwrap_or(false)
        })
        .await
    );

    // the race is legitimate: either the hello already landed (send ok) or
    // the gate rejects with the pinned code
    match a.send("gate-node-b", 1, b"early") {
        Ok(()) => {}
        Err(e) => assert_eq!(e, SendError::NoHelloYet),
    }

    assert!(wait_until(Duration::from_secs(5), || hello_done(&a, "gate-node-b")).await);

    a.shutdown();
    b.shutdown();
    Ok(())
}
