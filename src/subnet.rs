// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Multi-subnet failover.
//!
//! A deployment may list up to sixteen DNS suffixes, each naming a physical
//! network plane. Dialing appends a suffix to the peer hostname and uses
//! the first one that resolves, starting from a random offset so load
//! spreads. The watchdog marks the suffix of a silent link bad; that single
//! suffix is skipped until its blackout timer expires. Killing a suffix
//! closes every socket currently bound through it, across every Net in the
//! process.

use std::{
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use rand::RngExt;
use tracing::{info, warn};

use crate::net::Net;

pub const MAX_SUBNETS: usize = 16;
const DEFAULT_BLACKOUT: Duration = Duration::from_secs(5);

struct SubnetState {
    suffixes: Vec<Arc<str>>,
    disabled: Vec<bool>,
    last_bad_idx: Option<usize>,
    last_bad_at: Option<Instant>,
    blackout: Duration,
}

static STATE: Lazy<Mutex<SubnetState>> = Lazy::new(|| {
    Mutex::new(SubnetState {
        suffixes: Vec::new(),
        disabled: Vec::new(),
        last_bad_idx: None,
        last_bad_at: None,
        blackout: DEFAULT_BLACKOUT,
    })
});

/// Every Net in the process, for the subnet killer.
static NETS: Lazy<Mutex<Vec<Weak<Net>>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn state() -> std::sync::MutexGuard<'static, SubnetState> {
    match STATE.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn nets() -> std::sync::MutexGuard<'static, Vec<Weak<Net>>> {
    match NETS.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Register a subnet suffix, e.g. `"-a"`.
pub fn add_subnet(suffix: &str) -> Result<()> {
    let mut st = state();
    if st.suffixes.iter().any(|s| &**s == suffix) {
        return Ok(());
    }
    if st.suffixes.len() >= MAX_SUBNETS {
        bail!("subnet table full ({MAX_SUBNETS} entries)");
    }
    st.suffixes.push(Arc::from(suffix));
    st.disabled.push(false);
    Ok(())
}

/// Administratively disable or re-enable a suffix.
pub fn clip_subnet(suffix: &str, disable: bool) {
    let mut st = state();
    if let Some(idx) = st.suffixes.iter().position(|s| &**s == suffix) {
        st.disabled[idx] = disable;
        info!(suffix, disable, "subnet clipped");
    }
}

pub fn is_disabled(suffix: &str) -> bool {
    let st = state();
    st.suffixes
        .iter()
        .position(|s| &**s == suffix)
        .map(|idx| st.disabled[idx])
        .unwrap_or(false)
}

pub fn set_blackout(timeout: Duration) {
    state().blackout = timeout;
}

/// Record a suffix as bad; it will be skipped until the blackout expires.
/// Only the single most recent offender is remembered.
pub fn mark_bad(suffix: &str) {
    let mut st = state();
    if let Some(idx) = st.suffixes.iter().position(|s| &**s == suffix) {
        st.last_bad_idx = Some(idx);
        st.last_bad_at = Some(Instant::now());
        warn!(suffix, "subnet marked bad");
    }
}

/// The currently blacked-out suffix, if its timer has not expired.
pub fn blacked_out_subnet() -> Option<Arc<str>> {
    let st = state();
    let idx = st.last_bad_idx?;
    let at = st.last_bad_at?;
    (at.elapsed() < st.blackout).then(|| st.suffixes[idx].clone())
}

/// Drop all registered suffixes and forget the blackout. Configuration
/// reload only; live sockets keep their recorded suffix.
pub fn clear_subnets() {
    let mut st = state();
    st.suffixes.clear();
    st.disabled.clear();
    st.last_bad_idx = None;
    st.last_bad_at = None;
    st.blackout = DEFAULT_BLACKOUT;
}

/// Pick the hostname to dial for `host`: iterate the suffixes from a random
/// offset, skipping disabled entries and the blacked-out one, and take the
/// first suffix under which the name resolves. No subnets configured (or
/// none resolving) falls back to the bare name.
pub async fn dedicated_conhost(net: &Net, host: &str) -> (String, Option<Arc<str>>) {
    let (candidates, start) = {
        let st = state();
        if st.suffixes.is_empty() {
            return (host.to_string(), None);
        }
        let mut bad_idx = None;
        if let (Some(idx), Some(at)) = (st.last_bad_idx, st.last_bad_at)
            && at.elapsed() < st.blackout
        {
            bad_idx = Some(idx);
        }
        let candidates: Vec<(usize, Arc<str>)> = st
            .suffixes
            .iter()
            .enumerate()
            .filter(|(idx, _)| !st.disabled[*idx] && Some(*idx) != bad_idx)
            .map(|(idx, s)| (idx, s.clone()))
            .collect();
        let start = if candidates.is_empty() {
            0
        } else {
            crate::conn::connector::jitter_rng().random_range(0..candidates.len())
        };
        (candidates, start)
    };

    for step in 0..candidates.len() {
        let (_, suffix) = &candidates[(start + step) % candidates.len()];
        let name = format!("{host}{suffix}");
        if net.resolve_host(&name).await.is_some() {
            return (name, Some(suffix.clone()));
        }
    }
    (host.to_string(), None)
}

/// Which configured suffix did an inbound socket arrive through? Matched by
/// resolving our own name under each suffix and comparing addresses.
pub async fn match_local_subnet(
    net: &Net,
    local_ip: Option<std::net::IpAddr>,
) -> Option<Arc<str>> {
    let local_ip = local_ip?;
    let suffixes: Vec<Arc<str>> = state().suffixes.clone();
    for suffix in suffixes {
        let name = format!("{}{}", net.my_host(), suffix);
        if net.resolve_host(&name).await == Some(local_ip) {
            return Some(suffix);
        }
    }
    None
}

/// Track a Net for the subnet killer.
pub(crate) fn register_net(net: &Arc<Net>) {
    let mut list = nets();
    list.retain(|w| w.strong_count() > 0);
    list.push(Arc::downgrade(net));
}

/// Shut down every peer socket in the process currently bound through
/// `suffix`, marking it bad first.
pub fn kill_subnet(suffix: &str) {
    mark_bad(suffix);
    let live: Vec<Arc<Net>> = nets().iter().filter_map(Weak::upgrade).collect();
    for net in live {
        for peer in net.peers() {
            if peer.current_subnet().as_deref() == Some(suffix) {
                warn!(host = %peer.host, suffix, "killing socket on dead subnet");
                peer.close_connection();
            }
        }
    }
}
