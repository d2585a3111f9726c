// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One record per known remote host.
//!
//! A peer is created when the host is first learned (config, accept, or
//! gossip) and destroyed only by its connector task after the reader and
//! writer have drained. The connection slot holds no socket halves; those
//! are owned by the IO tasks, and the slot's cancellation token stands in
//! for `shutdown(fd, RDWR)`: cancelling it unblocks both tasks, and the
//! last task out clears the slot.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    ack::AckWait,
    intern::HostRef,
    queue::{QueueStats, SendQueue},
};

/// Which IO task is reporting in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoTask {
    Reader,
    Writer,
}

/// Lifecycle state derived from the peer's flags, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Metadata for the currently installed socket.
#[derive(Debug)]
pub struct ConnHandle {
    /// Cancelling this unblocks the reader and writer immediately.
    pub token: CancellationToken,
    /// Subnet suffix the socket was bound through, if any.
    pub subnet: Option<Arc<str>>,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

pub struct Peer {
    pub host: HostRef,
    pub port: AtomicI32,
    /// Set when the port came from configuration; the connector then never
    /// consults the port-mux.
    pub explicit_port: AtomicBool,
    /// Cached resolved address; the UDP side-channel reads it.
    pub addr: Mutex<Option<SocketAddr>>,
    pub queue: SendQueue,

    /// Outstanding ack waiters, usually a handful.
    pub waits: Mutex<Vec<AckWait>>,
    pub ack_wakeup: Notify,

    conn: Mutex<Option<ConnHandle>>,
    /// Kicks the connector out of its retry sleep.
    pub connector_kick: Notify,

    closed: AtomicBool,
    really_closed: AtomicBool,
    got_hello: AtomicBool,
    decom_flag: AtomicBool,
    distress: AtomicBool,
    hostdown_reported: AtomicBool,

    /// Unix seconds of the last successfully read frame.
    pub timestamp: AtomicI64,
    /// Nonzero while a user handler runs; the watchdog spares such peers.
    pub running_user_func: AtomicU32,

    have_connector: AtomicBool,
    have_reader: AtomicBool,
    have_writer: AtomicBool,
    pub throttle_waiters: AtomicU32,

    pub sends: AtomicU64,
    pub flushes: AtomicU64,
    pub udp_sent: AtomicU64,
    pub udp_recv: AtomicU64,
    pub connect_attempts: AtomicU64,
    pub connect_failures: AtomicU64,
    pub user_msg_count: AtomicU64,
    pub user_func_micros: AtomicU64,

    /// Subnet suffix the current (or last) socket went through.
    pub subnet: Mutex<Option<Arc<str>>>,

    /// Pre-allocated inbound scratch for the user-message fast path.
    pub scratch: tokio::sync::Mutex<BytesMut>,
}

/// Point-in-time view of one peer for management/telemetry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerSnapshot {
    pub host: String,
    pub port: i32,
    pub state: PeerState,
    pub got_hello: bool,
    pub subnet: Option<String>,
    pub queue: QueueStats,
    pub sends: u64,
    pub flushes: u64,
    pub udp_sent: u64,
    pub udp_recv: u64,
}

impl Peer {
    pub fn new(host: HostRef, port: i32, explicit_port: bool, scratch_len: usize) -> Arc<Self> {
        Arc::new(Self {
            host,
            port: AtomicI32::new(port),
            explicit_port: AtomicBool::new(explicit_port),
            addr: Mutex::new(None),
            queue: SendQueue::new(),
            waits: Mutex::new(Vec::new()),
            ack_wakeup: Notify::new(),
            conn: Mutex::new(None),
            connector_kick: Notify::new(),
            closed: AtomicBool::new(false),
            really_closed: AtomicBool::new(true),
            got_hello: AtomicBool::new(false),
            decom_flag: AtomicBool::new(false),
            distress: AtomicBool::new(false),
            hostdown_reported: AtomicBool::new(false),
            timestamp: AtomicI64::new(now_secs()),
            running_user_func: AtomicU32::new(0),
            have_connector: AtomicBool::new(false),
            have_reader: AtomicBool::new(false),
            have_writer: AtomicBool::new(false),
            throttle_waiters: AtomicU32::new(0),
            sends: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            udp_sent: AtomicU64::new(0),
            udp_recv: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            user_msg_count: AtomicU64::new(0),
            user_func_micros: AtomicU64::new(0),
            subnet: Mutex::new(None),
            scratch: tokio::sync::Mutex::new(BytesMut::with_capacity(scratch_len)),
        })
    }

    // --- flags ---

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_really_closed(&self) -> bool {
        self.really_closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn got_hello(&self) -> bool {
        self.got_hello.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_got_hello(&self) {
        self.got_hello.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_decommissioned(&self) -> bool {
        self.decom_flag.load(Ordering::Acquire)
    }

    pub fn set_decommissioned(&self) {
        self.decom_flag.store(true, Ordering::Release);
        self.connector_kick.notify_waiters();
    }

    /// First IO error flips distress on (worth one log line); recovery
    /// clears it. Returns whether the state changed.
    pub fn set_distress(&self, on: bool) -> bool {
        self.distress.swap(on, Ordering::AcqRel) != on
    }

    // --- connection slot ---

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.conn_guard().is_some()
    }

    /// Install a fresh socket's handle, clearing `closed`/`really_closed`.
    pub fn install_connection(&self, handle: ConnHandle) {
        let mut slot = self.conn_guard();
        if let Some(old) = slot.take() {
            old.token.cancel();
        }
        *slot = Some(handle);
        self.closed.store(false, Ordering::Release);
        self.really_closed.store(false, Ordering::Release);
        self.hostdown_reported.store(false, Ordering::Release);
        self.touch();
    }

    /// Latch the hostdown notification; true means this caller should fire
    /// the callback. Re-armed by the next successful connection.
    pub fn take_hostdown_report(&self) -> bool {
        !self.hostdown_reported.swap(true, Ordering::AcqRel)
    }

    /// Request teardown: cancel the socket token so both IO tasks unblock.
    /// The last task out completes the close; a socket that never got its
    /// tasks is completed right here.
    pub fn close_connection(&self) {
        self.closed.store(true, Ordering::Release);
        let mut slot = self.conn_guard();
        if let Some(handle) = slot.as_ref() {
            handle.token.cancel();
        }
        if !self.has_io_tasks() {
            *slot = None;
        }
        if slot.is_none() {
            self.really_closed.store(true, Ordering::Release);
        }
        drop(slot);
        self.connector_kick.notify_waiters();
        // unblock a writer parked on its wakeup and any throttled producers
        self.queue.write_wakeup.notify_waiters();
        self.queue.throttle_wakeup.notify_waiters();
    }

    /// Current socket token, if a socket is installed.
    pub fn conn_token(&self) -> Option<CancellationToken> {
        self.conn_guard().as_ref().map(|h| h.token.clone())
    }

    pub fn conn_subnet(&self) -> Option<Arc<str>> {
        self.conn_guard().as_ref().and_then(|h| h.subnet.clone())
    }

    /// IO task exit hook; the last one out clears the slot and marks the
    /// peer really closed.
    ///
    /// The slot is only cleared when its token is already cancelled. A live
    /// token means the accept path has swapped a fresh socket in while we
    /// were exiting; that connection is not ours to tear down.
    pub fn io_task_exited(&self, which: IoTask) {
        match which {
            IoTask::Reader => self.have_reader.store(false, Ordering::Release),
            IoTask::Writer => self.have_writer.store(false, Ordering::Release),
        }
        if !self.have_reader.load(Ordering::Acquire)
            && !self.have_writer.load(Ordering::Acquire)
        {
            let mut slot = self.conn_guard();
            if slot
                .as_ref()
                .map(|h| h.token.is_cancelled())
                .unwrap_or(false)
            {
                *slot = None;
            }
            if slot.is_none() {
                self.closed.store(true, Ordering::Release);
                self.really_closed.store(true, Ordering::Release);
                drop(slot);
                self.connector_kick.notify_waiters();
            }
        }
    }

    // --- task presence ---

    /// Claim a task slot; returns false when one is already running.
    pub fn claim_task(&self, which: &AtomicBool) -> bool {
        !which.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn connector_bit(&self) -> &AtomicBool {
        &self.have_connector
    }

    #[inline]
    pub fn reader_bit(&self) -> &AtomicBool {
        &self.have_reader
    }

    #[inline]
    pub fn writer_bit(&self) -> &AtomicBool {
        &self.have_writer
    }

    pub fn has_io_tasks(&self) -> bool {
        self.have_reader.load(Ordering::Acquire)
            || self.have_writer.load(Ordering::Acquire)
    }

    pub fn has_connector(&self) -> bool {
        self.have_connector.load(Ordering::Acquire)
    }

    // --- liveness ---

    #[inline]
    pub fn touch(&self) {
        self.timestamp.store(now_secs(), Ordering::Release);
    }

    #[inline]
    pub fn idle_secs(&self) -> i64 {
        now_secs() - self.timestamp.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PeerState {
        let connected = self.conn_guard().is_some();
        match (connected, self.is_closed(), self.is_really_closed()) {
            (true, false, _) => PeerState::Connected,
            (true, true, _) => PeerState::Closing,
            (false, _, false) => PeerState::Closing,
            (false, _, true) if self.has_connector() => PeerState::Connecting,
            _ => PeerState::Disconnected,
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            host: self.host.as_str().to_string(),
            port: self.port.load(Ordering::Acquire),
            state: self.state(),
            got_hello: self.got_hello(),
            subnet: self.subnet_guard().as_ref().map(|s| s.to_string()),
            queue: self.queue.stats(),
            sends: self.sends.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            udp_sent: self.udp_sent.load(Ordering::Relaxed),
            udp_recv: self.udp_recv.load(Ordering::Relaxed),
        }
    }

    pub fn set_subnet(&self, subnet: Option<Arc<str>>) {
        *self.subnet_guard() = subnet;
    }

    pub fn current_subnet(&self) -> Option<Arc<str>> {
        self.subnet_guard().clone()
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        match self.addr.lock() {
            Ok(mut g) => *g = Some(addr),
            Err(p) => *p.into_inner() = Some(addr),
        }
    }

    pub fn cached_addr(&self) -> Option<SocketAddr> {
        match self.addr.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    fn conn_guard(&self) -> std::sync::MutexGuard<'_, Option<ConnHandle>> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn subnet_guard(&self) -> std::sync::MutexGuard<'_, Option<Arc<str>>> {
        match self.subnet.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("host", &self.host)
            .field("port", &self.port.load(Ordering::Relaxed))
            .field("state", &self.state())
            .field("got_hello", &self.got_hello())
            .finish_non_exhaustive()
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
