// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use netbus::{
    cfg::config::{ClusterMember, NetConfig},
    net::Net,
};
use tokio::time::{Instant, sleep};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Start a Net on an ephemeral port. `all_names` seeds the address
/// overrides so every hostname the test will ever learn (gossip included)
/// resolves to loopback; `members` is the configured cluster.
pub async fn start_net(
    name: &str,
    all_names: &[&str],
    members: &[(&str, i32)],
    tune: impl FnOnce(&mut NetConfig),
) -> Result<Arc<Net>> {
    let mut cfg = NetConfig::for_host(name, 0);
    cfg.tuning.heartbeat_send_time = 1;
    cfg.tuning.heartbeat_check_time = 5;
    for (host, port) in members {
        cfg.cluster.push(ClusterMember {
            host: host.to_string(),
            port: *port,
        });
    }
    tune(&mut cfg);

    let net = Net::create(&cfg)?;
    net.set_host_overrides(loopback_overrides(all_names));
    net.start().await.context("net start")?;
    Ok(net)
}

/// Map every name (and its subnet-suffixed forms) to loopback. The two
/// planes get distinct 127.0.0.0/8 addresses so the accept side can tell
/// which one an inbound socket arrived through.
pub fn loopback_overrides(names: &[&str]) -> HashMap<String, IpAddr> {
    let mut map = HashMap::new();
    for name in names {
        map.insert(name.to_string(), LOCALHOST);
        map.insert(format!("{name}-a"), LOCALHOST);
        map.insert(
            format!("{name}-b"),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
        );
    }
    map
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// True once `net` has a live, gossip-complete link to `host`.
pub fn hello_done(net: &Net, host: &str) -> bool {
    net.directory()
        .lookup_name(host)
        .map(|p| p.is_connected() && p.got_hello())
        .unwrap_or(false)
}
