// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The peer directory: every host this Net knows about.
//!
//! Cluster size is a few dozen at most, so lookups are a linear scan over
//! interned handles behind a readers-writer lock, with a single-entry
//! `last_used` cache short-circuiting the common case. The writer lock is
//! held only for insert/remove.

use std::sync::{Arc, Mutex, RwLock};

use crate::{
    intern::{HostRef, intern},
    peer::{Peer, PeerSnapshot},
};

#[derive(Default)]
pub struct Directory {
    peers: RwLock<Vec<Arc<Peer>>>,
    last_used: Mutex<Option<Arc<Peer>>>,
    sanctioned: Mutex<Vec<(HostRef, i32)>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert: an existing entry for the interned host wins and
    /// the `added` flag is false.
    pub fn add(
        &self,
        host: &HostRef,
        port: i32,
        explicit_port: bool,
        scratch_len: usize,
    ) -> (Arc<Peer>, bool) {
        if let Some(existing) = self.lookup(host) {
            return (existing, false);
        }
        let mut peers = self.write_guard();
        // recheck under the writer lock; someone may have raced us
        if let Some(existing) = peers.iter().find(|p| p.host == *host) {
            return (existing.clone(), false);
        }
        let peer = Peer::new(host.clone(), port, explicit_port, scratch_len);
        peers.push(peer.clone());
        (peer, true)
    }

    pub fn lookup(&self, host: &HostRef) -> Option<Arc<Peer>> {
        {
            let cache = self.cache_guard();
            if let Some(peer) = cache.as_ref()
                && peer.host == *host
            {
                return Some(peer.clone());
            }
        }
        let found = self
            .read_guard()
            .iter()
            .find(|p| p.host == *host)
            .cloned()?;
        *self.cache_guard() = Some(found.clone());
        Some(found)
    }

    pub fn lookup_name(&self, host: &str) -> Option<Arc<Peer>> {
        self.lookup(&intern(host))
    }

    /// Unlink the peer. The caller (the connector, per the lifecycle rule)
    /// is responsible for having drained its tasks first.
    pub fn remove(&self, host: &HostRef) -> Option<Arc<Peer>> {
        let removed = {
            let mut peers = self.write_guard();
            let idx = peers.iter().position(|p| p.host == *host)?;
            Some(peers.swap_remove(idx))
        };
        let mut cache = self.cache_guard();
        if cache.as_ref().map(|p| p.host == *host).unwrap_or(false) {
            *cache = None;
        }
        removed
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.read_guard().clone()
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    /// `(host, port)` of every entry, the hello payload's raw material.
    pub fn hostlist(&self) -> Vec<(HostRef, i32)> {
        self.read_guard()
            .iter()
            .map(|p| {
                (
                    p.host.clone(),
                    p.port.load(std::sync::atomic::Ordering::Acquire),
                )
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.read_guard().iter().map(|p| p.snapshot()).collect()
    }

    // --- sanctioned list ---

    /// Record a configured cluster member. Purely advisory; used by the
    /// membership-health probe, never by routing.
    pub fn sanction(&self, host: &HostRef, port: i32) {
        let mut list = self.sanctioned_guard();
        if !list.iter().any(|(h, _)| h == host) {
            list.push((host.clone(), port));
        }
    }

    pub fn unsanction(&self, host: &HostRef) {
        self.sanctioned_guard().retain(|(h, _)| h != host);
    }

    pub fn sanctioned(&self) -> Vec<(HostRef, i32)> {
        self.sanctioned_guard().clone()
    }

    /// Configured members that currently have a live, hello-complete link.
    pub fn sanctioned_and_connected(&self) -> Vec<HostRef> {
        let list = self.sanctioned();
        list.into_iter()
            .filter_map(|(host, _)| {
                let peer = self.lookup(&host)?;
                (peer.is_connected() && peer.got_hello()).then_some(host)
            })
            .collect()
    }

    // --- lock plumbing ---

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Peer>>> {
        match self.peers.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Peer>>> {
        match self.peers.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn cache_guard(&self) -> std::sync::MutexGuard<'_, Option<Arc<Peer>>> {
        match self.last_used.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn sanctioned_guard(&self) -> std::sync::MutexGuard<'_, Vec<(HostRef, i32)>> {
        match self.sanctioned.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}
