// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use netbus::{
    callbacks::{MAX_USER_TYPE, UserHandler},
    cfg::config::NetConfig,
    error::SendError,
    intern::intern,
    net::Net,
    peer::PeerState,
};

fn quiet_net(name: &str) -> Arc<Net> {
    Net::create(&NetConfig::for_host(name, 9000)).expect("create net")
}

#[test]
fn sender_error_codes_are_stable() {
    assert_eq!(SendError::NoHelloYet.code(), -9);
    assert!(SendError::QueueFull.code() < 0);
    assert!(SendError::Timeout.code() < 0);
}

#[test]
fn send_rejections_by_target_state() {
    let net = quiet_net("api-node-self");

    // unknown host
    assert_eq!(
        net.send("api-ghost", 1, b"x").expect_err("unknown host"),
        SendError::InvalidNode
    );
    // ourselves
    assert_eq!(
        net.send("api-node-self", 1, b"x").expect_err("self send"),
        SendError::SendToMe
    );
}

#[test]
fn handler_table_covers_zero_through_max() {
    let net = quiet_net("api-node-table");
    let handler: UserHandler = Arc::new(|_, _| {});

    net.register_user_handler(0, "first", handler.clone())
        .expect("usertype 0");
    net.register_user_handler(MAX_USER_TYPE, "last", handler.clone())
        .expect("usertype max");
    assert!(
        net.register_user_handler(MAX_USER_TYPE + 1, "past-the-end", handler)
            .is_err()
    );
}

#[test]
fn snapshot_lists_configured_members() {
    let mut cfg = NetConfig::for_host("api-node-snap", 9000);
    cfg.cluster.push(netbus::cfg::config::ClusterMember {
        host: "api-node-snap-peer".to_string(),
        port: 9001,
    });
    let net = Net::create(&cfg).expect("create");

    let snap = net.snapshot();
    assert_eq!(snap.hostname, "api-node-snap");
    assert_eq!(snap.peers.len(), 2); // ourselves plus the member
    let peer = snap
        .peers
        .iter()
        .find(|p| p.host == "api-node-snap-peer")
        .expect("member present");
    assert_eq!(peer.state, PeerState::Disconnected);
    assert!(!peer.got_hello);

    // json form stays shippable
    let json = snap.to_json();
    assert_eq!(json["hostname"], "api-node-snap");
}

#[test]
fn directory_add_remove_round_trip() {
    let net = quiet_net("api-node-dir");
    let host = intern("api-node-dir-peer");

    let dir = net.directory();
    let (peer, added) = dir.add(&host, 9001, true, 1024);
    assert!(added);
    let (again, added_again) = dir.add(&host, 9001, true, 1024);
    assert!(!added_again);
    assert!(Arc::ptr_eq(&peer, &again));

    assert!(dir.remove(&host).is_some());
    assert!(dir.lookup(&host).is_none());
    // removing twice is a no-op
    assert!(dir.remove(&host).is_none());
}

#[test]
fn sanctioned_probe_needs_a_live_link() {
    let mut cfg = NetConfig::for_host("api-node-sanc", 9000);
    cfg.cluster.push(netbus::cfg::config::ClusterMember {
        host: "api-node-sanc-peer".to_string(),
        port: 9001,
    });
    let net = Net::create(&cfg).expect("create");
    // configured but never connected
    assert!(net.sanctioned_and_connected().is_empty());
}
