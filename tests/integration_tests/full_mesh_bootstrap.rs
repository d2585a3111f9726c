// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;

use crate::integration_tests::common::{hello_done, start_net, wait_until};

const NODE_A: &str = "mesh-node-a";
const NODE_B: &str = "mesh-node-b";
const NODE_C: &str = "mesh-node-c";
const ALL: &[&str] = &[NODE_A, NODE_B, NODE_C];

/// Three nodes, only A↔B and C↔B configured. Gossip has to close the
/// A↔C edge on its own.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn gossip_closes_the_mesh() -> Result<()> {
    let b = start_net(NODE_B, ALL, &[], |_| {}).await?;
    let b_port = b.advertised_port();

    let a = start_net(NODE_A, ALL, &[(NODE_B, b_port)], |_| {}).await?;
    let c = start_net(NODE_C, ALL, &[(NODE_B, b_port)], |_| {}).await?;

    // configured edges come up
    assert!(wait_until(Duration::from_secs(5), || hello_done(&a, NODE_B)).await);
    assert!(wait_until(Duration::from_secs(5), || hello_done(&c, NODE_B)).await);

    // the gossiped edge closes without configuration; crossed dials may
    // cost one reconnect cycle, so the window is generous
    assert!(
        wait_until(Duration::from_secs(15), || {
            hello_done(&a, NODE_C) && hello_done(&c, NODE_A)
        })
        .await,
        "a and c never learned of each other"
    );

    // b saw both inbound links and completed gossip on each
    assert!(hello_done(&b, NODE_A));
    assert!(hello_done(&b, NODE_C));

    a.shutdown();
    b.shutdown();
    c.shutdown();
    Ok(())
}
