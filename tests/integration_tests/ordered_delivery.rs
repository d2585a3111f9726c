// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use serial_test::serial;
use tokio::time::sleep;

use netbus::{callbacks::Callbacks, queue::EnqueueFlags};

use crate::integration_tests::common::{hello_done, start_net, wait_until};

const NODE_A: &str = "order-node-a";
const NODE_B: &str = "order-node-b";
const ALL: &[&str] = &[NODE_A, NODE_B];
const ORDERED_TYPE: usize = 9;

/// Lexicographic order over the user payload (the frame body carries the
/// 16-byte user header first).
fn payload_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.get(16..).cmp(&b.get(16..))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn inorder_sorts_within_a_batch_but_not_across_delivered_frames() -> Result<()> {
    let b = start_net(NODE_B, ALL, &[], |cfg| {
        cfg.tuning.heartbeat_send_time = 30;
        cfg.tuning.heartbeat_check_time = 60;
    })
    .await?;
    let a = start_net(NODE_A, ALL, &[(NODE_B, b.advertised_port())], |cfg| {
        cfg.tuning.heartbeat_send_time = 30;
        cfg.tuning.heartbeat_check_time = 60;
        cfg.tuning.enque_reorder_lookahead = 5;
    })
    .await?;

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    b.register_user_handler(
        ORDERED_TYPE,
        "ordered",
        Arc::new(move |_, data| {
            sink.lock().expect("sink").push(data.to_vec());
        }),
    )?;

    // a 200ms artificial send delay holds the writer inside a batch long
    // enough for the queue to fill behind it
    a.set_callbacks(Callbacks {
        netcmp: Some(Arc::new(payload_cmp)),
        net_delay: Some(Arc::new(|_| Some(Duration::from_millis(200)))),
        ..Default::default()
    });

    assert!(wait_until(Duration::from_secs(5), || hello_done(&a, NODE_B)).await);
    assert!(wait_until(Duration::from_secs(5), || hello_done(&b, NODE_A)).await);

    // batch 1: a NODELAY frame occupies the writer, then five INORDER
    // frames queue up behind it in reverse order
    a.send(NODE_B, ORDERED_TYPE as i32, b"00")?;
    sleep(Duration::from_millis(50)).await;
    for payload in [&b"e"[..], b"d", b"c", b"b", b"a"] {
        a.send_with_flags(NODE_B, ORDERED_TYPE as i32, payload, EnqueueFlags::INORDER)?;
    }

    // let batch 1 drain completely before starting batch 2
    sleep(Duration::from_millis(600)).await;

    // batch 2: six frames against a five-slot window; "u" walks the full
    // window but cannot overtake anything already on the wire
    for payload in [&b"z"[..], b"y", b"x", b"w", b"v", b"u"] {
        a.send_with_flags(NODE_B, ORDERED_TYPE as i32, payload, EnqueueFlags::INORDER)?;
    }
    a.send(NODE_B, ORDERED_TYPE as i32, b"99")?;

    assert!(
        wait_until(Duration::from_secs(5), || {
            received.lock().expect("sink").len() == 13
        })
        .await,
        "only {} frames arrived",
        received.lock().expect("sink").len()
    );

    let got: Vec<Vec<u8>> = received.lock().expect("sink").clone();
    let expected: Vec<&[u8]> = vec![
        b"00", b"a", b"b", b"c", b"d", b"e", b"u", b"v", b"w", b"x", b"y", b"z", b"99",
    ];
    let got_refs: Vec<&[u8]> = got.iter().map(|v| v.as_slice()).collect();
    assert_eq!(got_refs, expected);

    a.shutdown();
    b.shutdown();
    Ok(())
}
