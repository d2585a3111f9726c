// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;

use netbus::subnet;

use crate::integration_tests::common::{hello_done, start_net, wait_until};

const NODE_A: &str = "subnet-node-a";
const NODE_B: &str = "subnet-node-b";
const ALL: &[&str] = &[NODE_A, NODE_B];

/// Two planes; killing the one in use flips the link to the other within
/// one reconnect.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn killing_a_subnet_fails_over_to_the_other() -> Result<()> {
    subnet::clear_subnets();
    subnet::add_subnet("-a")?;
    subnet::add_subnet("-b")?;
    // long blackout so the retry cannot land back on the dead plane
    subnet::set_blackout(Duration::from_secs(60));

    let b = start_net(NODE_B, ALL, &[], |_| {}).await?;
    let a = start_net(NODE_A, ALL, &[(NODE_B, b.advertised_port())], |_| {}).await?;

    assert!(wait_until(Duration::from_secs(5), || hello_done(&a, NODE_B)).await);

    let peer = a
        .directory()
        .lookup_name(NODE_B)
        .expect("peer record exists");
    let first = peer.current_subnet().expect("dial went through a subnet");
    let survivor: &str = if &*first == "-a" { "-b" } else { "-a" };

    subnet::kill_subnet(&first);
    assert_eq!(
        subnet::blacked_out_subnet().as_deref(),
        Some(&*first),
        "killed suffix should be blacked out"
    );

    // reconnect jitter is up to 5s; give it room
    assert!(
        wait_until(Duration::from_secs(10), || {
            a.directory()
                .lookup_name(NODE_B)
                .map(|p| {
                    p.is_connected() && p.current_subnet().as_deref() == Some(survivor)
                })
                .unwrap_or(false)
        })
        .await,
        "link never came back on the surviving plane"
    );

    a.shutdown();
    b.shutdown();
    subnet::clear_subnets();
    Ok(())
}

/// A clipped (administratively disabled) subnet is never picked.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn clipped_subnet_is_skipped() -> Result<()> {
    subnet::clear_subnets();
    subnet::add_subnet("-a")?;
    subnet::add_subnet("-b")?;
    subnet::clip_subnet("-a", true);

    let b = start_net(NODE_B, ALL, &[], |_| {}).await?;
    let a = start_net(NODE_A, ALL, &[(NODE_B, b.advertised_port())], |_| {}).await?;

    assert!(wait_until(Duration::from_secs(5), || hello_done(&a, NODE_B)).await);
    let peer = a.directory().lookup_name(NODE_B).expect("peer");
    assert_eq!(peer.current_subnet().as_deref(), Some("-b"));

    a.shutdown();
    b.shutdown();
    subnet::clear_subnets();
    Ok(())
}
