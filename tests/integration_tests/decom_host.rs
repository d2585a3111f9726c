// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;

use netbus::error::SendError;

use crate::integration_tests::common::{hello_done, start_net, wait_until};

const NODE_A: &str = "decom-node-a";
const NODE_B: &str = "decom-node-b";
const ALL: &[&str] = &[NODE_A, NODE_B];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn decom_tears_the_peer_down_after_the_grace() -> Result<()> {
    let b = start_net(NODE_B, ALL, &[], |_| {}).await?;
    let a = start_net(NODE_A, ALL, &[(NODE_B, b.advertised_port())], |_| {}).await?;

    assert!(wait_until(Duration::from_secs(5), || hello_done(&a, NODE_B)).await);

    a.decom(NODE_B).expect("decom accepted");

    // the flag lands immediately: no new traffic is accepted
    assert_eq!(
        a.send(NODE_B, 1, b"too late").expect_err("decommissioned"),
        SendError::InvalidNode
    );

    // after the 2s grace the record disappears entirely
    assert!(
        wait_until(Duration::from_secs(6), || {
            a.directory().lookup_name(NODE_B).is_none()
        })
        .await,
        "peer record survived the decommission"
    );
    assert_eq!(
        a.send(NODE_B, 1, b"gone").expect_err("unknown now"),
        SendError::InvalidNode
    );

    // decommissioning an unknown host is its own error
    assert_eq!(
        a.decom("decom-node-ghost").expect_err("never existed"),
        SendError::InvalidNode
    );

    a.shutdown();
    b.shutdown();
    Ok(())
}
