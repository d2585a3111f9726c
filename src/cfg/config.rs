// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Top-level Net configuration, usually loaded from YAML.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetConfig {
    /// Who this endpoint is and how the port-mux sees it.
    pub identity: Identity,
    /// Configured cluster membership (the sanctioned list).
    #[serde(default)]
    pub cluster: Vec<ClusterMember>,
    /// Subnet suffixes for multi-plane deployments, most preferred first.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Runtime knobs; every field has a default and may be applied live.
    #[serde(default)]
    pub tuning: Tuning,
}

/// Endpoint identity.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Identity {
    /// Our own hostname as the rest of the cluster spells it.
    pub hostname: String,
    /// Listener port; 0 asks the port-mux for one.
    #[serde(default)]
    pub port: i32,
    /// `(app, service, instance)` tuple for port-mux registration.
    pub app: String,
    pub service: String,
    pub instance: String,
}

/// One configured cluster member.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClusterMember {
    pub host: String,
    /// 0 = resolve through the port-mux at connect time.
    #[serde(default)]
    pub port: i32,
}

/// Runtime knobs. Defaults follow the long-standing production values.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Tuning {
    /// Per-peer queue cap, entries.
    pub max_queue: usize,
    /// Per-peer queue cap, bytes; 0 = unlimited.
    pub max_bytes: u64,
    /// Seconds between heartbeats to each peer.
    pub heartbeat_send_time: u64,
    /// Seconds of silence before the watchdog kills a link.
    pub heartbeat_check_time: u64,
    /// Buffered-stream size for both directions of a peer socket.
    pub bufsz: usize,
    /// Default threshold for `throttle_wait`, percent of either cap.
    pub throttle_percent: u32,
    /// Flush after this many drained batches when nothing asked for NODELAY.
    pub enque_flush_interval: u32,
    /// INORDER insertion-sort window.
    pub enque_reorder_lookahead: usize,
    /// Seconds between port-mux re-registrations.
    pub portmux_register_interval: u64,
    /// Milliseconds a marked-bad subnet stays skipped.
    pub subnet_blackout_timems: u64,
    /// Seconds between connector attempt/failure dumps; 0 = off.
    pub conntime_dump_period: u64,
    /// First-byte poll on accepted sockets, milliseconds.
    pub netpoll_ms: u64,
    /// Per-peer inbound scratch buffer; larger user messages allocate.
    pub user_data_buf_size: usize,
    /// Log a queue histogram when an enqueue hits the cap.
    pub dump_queue_on_full: bool,
    /// Lift the loopback-only restriction on `@` admin sockets.
    pub allow_remote_admin: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_queue: 25_000,
            max_bytes: 0,
            heartbeat_send_time: 5,
            heartbeat_check_time: 10,
            bufsz: 1 << 20,
            throttle_percent: 50,
            enque_flush_interval: 1000,
            enque_reorder_lookahead: 20,
            portmux_register_interval: 600,
            subnet_blackout_timems: 5000,
            conntime_dump_period: 0,
            netpoll_ms: 100,
            user_data_buf_size: 256 * 1024,
            dump_queue_on_full: false,
            allow_remote_admin: false,
        }
    }
}

impl Tuning {
    #[inline]
    pub fn subnet_blackout(&self) -> Duration {
        Duration::from_millis(self.subnet_blackout_timems)
    }
}

impl NetConfig {
    /// Minimal config for a node whose peers all carry explicit ports.
    pub fn for_host(hostname: &str, port: i32) -> Self {
        Self {
            identity: Identity {
                hostname: hostname.to_string(),
                port,
                app: "app".to_string(),
                service: "replication".to_string(),
                instance: "default".to_string(),
            },
            cluster: Vec::new(),
            subnets: Vec::new(),
            tuning: Tuning::default(),
        }
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = resolve_config_path(path.as_ref())?;
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {path:?}"))?;
        let cfg: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config {path:?}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.identity.hostname.is_empty(), "hostname must be set");
        ensure!(
            (0..=0xffff).contains(&self.identity.port),
            "port {} out of range",
            self.identity.port
        );
        ensure!(
            self.subnets.len() <= crate::subnet::MAX_SUBNETS,
            "at most {} subnets",
            crate::subnet::MAX_SUBNETS
        );
        ensure!(self.tuning.max_queue > 0, "max_queue must be positive");
        ensure!(
            self.tuning.heartbeat_check_time >= self.tuning.heartbeat_send_time,
            "heartbeat_check_time below heartbeat_send_time would flap links"
        );
        for member in &self.cluster {
            ensure!(!member.host.is_empty(), "cluster member with empty host");
        }
        Ok(())
    }
}

fn resolve_config_path(rel: &Path) -> Result<PathBuf> {
    let abs = if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(rel)
    };
    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = NetConfig::for_host("node-1", 9000);
        cfg.validate().expect("valid");
        assert_eq!(cfg.tuning.max_queue, 25_000);
        assert_eq!(cfg.tuning.heartbeat_send_time, 5);
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
identity:
  hostname: node-1
  port: 9000
  app: app
  service: replication
  instance: default
cluster:
  - host: node-2
    port: 9000
  - host: node-3
subnets: ["-a", "-b"]
tuning:
  max_queue: 100
  heartbeat_send_time: 1
  heartbeat_check_time: 3
"#;
        let cfg: NetConfig = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.cluster.len(), 2);
        assert_eq!(cfg.cluster[1].port, 0);
        assert_eq!(cfg.subnets, vec!["-a", "-b"]);
        assert_eq!(cfg.tuning.max_queue, 100);
        // untouched knobs keep their defaults
        assert_eq!(cfg.tuning.netpoll_ms, 100);
    }

    #[test]
    fn bad_heartbeat_config_is_rejected() {
        let mut cfg = NetConfig::for_host("node-1", 9000);
        cfg.tuning.heartbeat_send_time = 30;
        cfg.tuning.heartbeat_check_time = 10;
        assert!(cfg.validate().is_err());
    }
}
