// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use netbus::cfg::config::{NetConfig, Tuning};

#[test]
fn minimal_yaml_gets_all_defaults() {
    let yaml = r#"
identity:
  hostname: cfg-node-1
  port: 19000
  app: app
  service: replication
  instance: default
"#;
    let cfg: NetConfig = serde_yaml::from_str(yaml).expect("parse");
    cfg.validate().expect("valid");
    assert!(cfg.cluster.is_empty());
    assert!(cfg.subnets.is_empty());

    let t = Tuning::default();
    assert_eq!(cfg.tuning.max_queue, t.max_queue);
    assert_eq!(cfg.tuning.user_data_buf_size, 256 * 1024);
    assert_eq!(cfg.tuning.subnet_blackout_timems, 5000);
}

#[test]
fn port_zero_means_portmux_or_ephemeral() {
    let yaml = r#"
identity:
  hostname: cfg-node-2
  app: app
  service: replication
  instance: default
"#;
    let cfg: NetConfig = serde_yaml::from_str(yaml).expect("parse");
    assert_eq!(cfg.identity.port, 0);
    cfg.validate().expect("port 0 is fine");
}

#[test]
fn too_many_subnets_rejected() {
    let mut cfg = NetConfig::for_host("cfg-node-3", 19000);
    cfg.subnets = (0..17).map(|i| format!("-{i}")).collect();
    assert!(cfg.validate().is_err());
}

#[test]
fn empty_cluster_member_rejected() {
    let mut cfg = NetConfig::for_host("cfg-node-4", 19000);
    cfg.cluster.push(netbus::cfg::config::ClusterMember {
        host: String::new(),
        port: 0,
    });
    assert!(cfg.validate().is_err());
}
