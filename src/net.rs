// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One messaging endpoint: the Net.
//!
//! A Net owns its listener, peer directory, heartbeat and watchdog tasks,
//! and the user-handler table. Child Nets share the parent's listener and
//! are told apart by the child-net number carried in the connect frame.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        Arc, RwLock, Weak,
        atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use once_cell::sync::OnceCell;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zerocopy::IntoBytes;

use crate::{
    ack::{self, AckOutcome},
    callbacks::{Callbacks, MAX_USER_TYPE, QueueStatHooks, UserFunc, UserHandler},
    cfg::config::{NetConfig, Tuning},
    conn::{accept::accept_task, connector::connector_task},
    directory::Directory,
    error::{SendError, SendResult},
    intern::{HostRef, intern},
    peer::{Peer, PeerSnapshot},
    portmux::PortMux,
    queue::{EnqueueFlags, QueueCaps, QueueEntry},
    subnet,
    wire::{kind::WireKind, user::UserMsgHeader},
};

/// Tuning knobs in their live, atomically updatable form.
pub struct LiveTuning {
    max_queue: AtomicUsize,
    max_bytes: AtomicU64,
    heartbeat_send_time: AtomicU64,
    heartbeat_check_time: AtomicU64,
    bufsz: AtomicUsize,
    throttle_percent: AtomicU32,
    enque_flush_interval: AtomicU32,
    reorder_lookahead: AtomicUsize,
    portmux_register_interval: AtomicU64,
    conntime_dump_period: AtomicU64,
    netpoll_ms: AtomicU64,
    user_data_buf_size: AtomicUsize,
    dump_queue_on_full: AtomicBool,
    allow_remote_admin: AtomicBool,
}

impl LiveTuning {
    fn from_config(t: &Tuning) -> Self {
        let live = Self {
            max_queue: AtomicUsize::new(0),
            max_bytes: AtomicU64::new(0),
            heartbeat_send_time: AtomicU64::new(0),
            heartbeat_check_time: AtomicU64::new(0),
            bufsz: AtomicUsize::new(0),
            throttle_percent: AtomicU32::new(0),
            enque_flush_interval: AtomicU32::new(0),
            reorder_lookahead: AtomicUsize::new(0),
            portmux_register_interval: AtomicU64::new(0),
            conntime_dump_period: AtomicU64::new(0),
            netpoll_ms: AtomicU64::new(0),
            user_data_buf_size: AtomicUsize::new(0),
            dump_queue_on_full: AtomicBool::new(false),
            allow_remote_admin: AtomicBool::new(false),
        };
        live.apply(t);
        live
    }

    /// Apply a new tuning snapshot; takes effect on the next use of each
    /// knob.
    pub fn apply(&self, t: &Tuning) {
        self.max_queue.store(t.max_queue, Ordering::Release);
        self.max_bytes.store(t.max_bytes, Ordering::Release);
        self.heartbeat_send_time
            .store(t.heartbeat_send_time, Ordering::Release);
        self.heartbeat_check_time
            .store(t.heartbeat_check_time, Ordering::Release);
        self.bufsz.store(t.bufsz, Ordering::Release);
        self.throttle_percent
            .store(t.throttle_percent, Ordering::Release);
        self.enque_flush_interval
            .store(t.enque_flush_interval.max(1), Ordering::Release);
        self.reorder_lookahead
            .store(t.enque_reorder_lookahead, Ordering::Release);
        self.portmux_register_interval
            .store(t.portmux_register_interval.max(1), Ordering::Release);
        self.conntime_dump_period
            .store(t.conntime_dump_period, Ordering::Release);
        self.netpoll_ms.store(t.netpoll_ms.max(1), Ordering::Release);
        self.user_data_buf_size
            .store(t.user_data_buf_size, Ordering::Release);
        self.dump_queue_on_full
            .store(t.dump_queue_on_full, Ordering::Release);
        self.allow_remote_admin
            .store(t.allow_remote_admin, Ordering::Release);
        subnet::set_blackout(t.subnet_blackout());
    }

    pub fn queue_caps(&self) -> QueueCaps {
        let max_bytes = self.max_bytes.load(Ordering::Acquire);
        QueueCaps {
            max_queue: self.max_queue.load(Ordering::Acquire),
            // 0 means unlimited
            max_bytes: if max_bytes == 0 { u64::MAX } else { max_bytes },
            reorder_lookahead: self.reorder_lookahead.load(Ordering::Acquire),
            dump_on_full: self.dump_queue_on_full.load(Ordering::Acquire),
        }
    }

    pub fn bufsz(&self) -> usize {
        self.bufsz.load(Ordering::Acquire)
    }

    pub fn enque_flush_interval(&self) -> u32 {
        self.enque_flush_interval.load(Ordering::Acquire)
    }

    pub fn heartbeat_send_time(&self) -> u64 {
        self.heartbeat_send_time.load(Ordering::Acquire)
    }

    pub fn heartbeat_check_time(&self) -> u64 {
        self.heartbeat_check_time.load(Ordering::Acquire)
    }

    pub fn throttle_percent(&self) -> u32 {
        self.throttle_percent.load(Ordering::Acquire)
    }

    pub fn portmux_register_interval(&self) -> u64 {
        self.portmux_register_interval.load(Ordering::Acquire)
    }

    pub fn conntime_dump_period(&self) -> u64 {
        self.conntime_dump_period.load(Ordering::Acquire)
    }

    pub fn netpoll_ms(&self) -> u64 {
        self.netpoll_ms.load(Ordering::Acquire)
    }

    pub fn user_data_buf_size(&self) -> usize {
        self.user_data_buf_size.load(Ordering::Acquire)
    }

    pub fn allow_remote_admin(&self) -> bool {
        self.allow_remote_admin.load(Ordering::Acquire)
    }
}

/// Point-in-time view of the whole endpoint.
#[derive(Debug, serde::Serialize)]
pub struct NetSnapshot {
    pub hostname: String,
    pub port: i32,
    pub peers: Vec<PeerSnapshot>,
    pub lsn: Option<Vec<u8>>,
}

impl NetSnapshot {
    /// JSON form for status appsocks and log shipping.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub struct Net {
    myhost: HostRef,
    myport: AtomicI32,
    app: String,
    service: String,
    instance: String,

    netnum: AtomicI32,
    parent: OnceCell<Weak<Net>>,
    children: DashMap<i32, Arc<Net>>,

    directory: Directory,
    tuning: LiveTuning,
    callbacks: RwLock<Callbacks>,
    userfuncs: RwLock<Vec<Option<UserFunc>>>,
    overrides: RwLock<HashMap<String, IpAddr>>,
    portmux: RwLock<Option<Arc<dyn PortMux>>>,

    /// Monotonic sequence numbers for ack-bearing sends, seeded from pid.
    seqnum: AtomicI32,
    exiting: CancellationToken,
    self_weak: OnceCell<Weak<Net>>,
    last_unknown_log: AtomicI64,
}

impl Net {
    /// Build a Net from its config. Registers the configured subnets and
    /// seeds the directory with ourselves plus the sanctioned members.
    /// Nothing touches the network until [`Net::start`].
    pub fn create(cfg: &NetConfig) -> Result<Arc<Self>> {
        cfg.validate()?;

        let myhost = intern(&cfg.identity.hostname);
        let net = Arc::new(Self {
            myhost: myhost.clone(),
            myport: AtomicI32::new(cfg.identity.port),
            app: cfg.identity.app.clone(),
            service: cfg.identity.service.clone(),
            instance: cfg.identity.instance.clone(),
            netnum: AtomicI32::new(0),
            parent: OnceCell::new(),
            children: DashMap::new(),
            directory: Directory::new(),
            tuning: LiveTuning::from_config(&cfg.tuning),
            callbacks: RwLock::new(Callbacks::default()),
            userfuncs: RwLock::new(vec![None; MAX_USER_TYPE + 1]),
            overrides: RwLock::new(HashMap::new()),
            portmux: RwLock::new(None),
            seqnum: AtomicI32::new(std::process::id() as i32),
            exiting: CancellationToken::new(),
            self_weak: OnceCell::new(),
            last_unknown_log: AtomicI64::new(0),
        });
        let _ = net.self_weak.set(Arc::downgrade(&net));

        for suffix in &cfg.subnets {
            subnet::add_subnet(suffix)?;
        }

        // ourselves first; hello payloads must advertise us
        let scratch = net.tuning.user_data_buf_size();
        net.directory.add(&myhost, cfg.identity.port, true, scratch);

        for member in &cfg.cluster {
            let host = intern(&member.host);
            if host == myhost {
                continue;
            }
            net.directory.add(&host, member.port, member.port > 0, scratch);
            net.directory.sanction(&host, member.port);
        }

        Ok(net)
    }

    /// Bind the listener and launch the accept, heartbeat, and watchdog
    /// tasks, plus a connector per configured member.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let configured = self.myport.load(Ordering::Acquire);
        let port = if configured == 0 {
            match self.portmux() {
                Some(mux) => i32::from(
                    mux.register(&self.app, &self.service, &self.instance)
                        .context("port-mux registration failed")?,
                ),
                // no port and no port-mux: take an ephemeral one
                None => 0,
            }
        } else {
            if let Some(mux) = self.portmux() {
                let _ = mux.use_port(&self.app, &self.service, &self.instance, configured as u16);
            }
            configured
        };

        let listener = TcpListener::bind(("0.0.0.0", port as u16))
            .await
            .with_context(|| format!("bind {port}"))?;
        let actual = i32::from(listener.local_addr()?.port());
        self.myport.store(actual, Ordering::Release);
        if let Some(me) = self.directory.lookup(&self.myhost) {
            me.port.store(actual, Ordering::Release);
        }
        info!(host = %self.myhost, port = actual, "listening");

        subnet::register_net(self);
        tokio::spawn(accept_task(self.clone(), listener));
        tokio::spawn(heartbeat_send_task(self.clone()));
        tokio::spawn(watchdog_task(self.clone()));

        for peer in self.directory.all() {
            if peer.host != self.myhost {
                self.ensure_connector(&peer);
            }
        }
        Ok(())
    }

    /// Stop every task at its next suspension point and tear down all
    /// sockets. Idempotent.
    pub fn shutdown(&self) {
        self.exiting.cancel();
        for peer in self.directory.all() {
            peer.close_connection();
        }
        for child in self.children.iter() {
            child.value().shutdown();
        }
    }

    // --- identity & plumbing ---

    #[inline]
    pub fn my_host(&self) -> &HostRef {
        &self.myhost
    }

    /// The port peers should dial; for a child Net, the parent's listener.
    pub fn advertised_port(&self) -> i32 {
        let own = self.myport.load(Ordering::Acquire);
        if own != 0 {
            return own;
        }
        self.parent
            .get()
            .and_then(Weak::upgrade)
            .map(|p| p.advertised_port())
            .unwrap_or(0)
    }

    /// `my_port` field for the connect frame, child-net number folded into
    /// the high bits.
    pub(crate) fn connect_port_field(&self) -> i32 {
        self.advertised_port() | (self.netnum.load(Ordering::Acquire) << 16)
    }

    #[inline]
    pub(crate) fn netnum(&self) -> i32 {
        self.netnum.load(Ordering::Acquire)
    }

    pub fn tuning(&self) -> &LiveTuning {
        &self.tuning
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.directory.all()
    }

    #[inline]
    pub(crate) fn exit_token(&self) -> &CancellationToken {
        &self.exiting
    }

    #[inline]
    pub fn is_exiting(&self) -> bool {
        self.exiting.is_cancelled()
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<Net>> {
        self.self_weak.get().and_then(Weak::upgrade)
    }

    pub(crate) fn service_tuple(&self) -> (String, String, String) {
        (
            self.app.clone(),
            self.service.clone(),
            self.instance.clone(),
        )
    }

    // --- registration surface ---

    pub fn set_callbacks(&self, cb: Callbacks) {
        *write_guard(&self.callbacks) = cb;
    }

    pub(crate) fn callbacks(&self) -> Callbacks {
        read_guard(&self.callbacks).clone()
    }

    pub fn set_portmux(&self, mux: Arc<dyn PortMux>) {
        *write_guard(&self.portmux) = Some(mux);
    }

    pub(crate) fn portmux(&self) -> Option<Arc<dyn PortMux>> {
        read_guard(&self.portmux).clone()
    }

    /// Register the handler for one user message type.
    pub fn register_user_handler(
        &self,
        usertype: usize,
        name: &'static str,
        handler: UserHandler,
    ) -> Result<()> {
        if usertype > MAX_USER_TYPE {
            bail!("usertype {usertype} above {MAX_USER_TYPE}");
        }
        write_guard(&self.userfuncs)[usertype] = Some(UserFunc { name, handler });
        Ok(())
    }

    pub(crate) fn userfunc(&self, usertype: usize) -> Option<UserFunc> {
        read_guard(&self.userfuncs).get(usertype).cloned().flatten()
    }

    /// Static name→address entries consulted before DNS.
    pub fn set_host_overrides(&self, entries: HashMap<String, IpAddr>) {
        *write_guard(&self.overrides) = entries;
    }

    pub fn apply_tuning(&self, t: &Tuning) {
        self.tuning.apply(t);
    }

    /// Attach `child` under `netnum`; inbound connect frames carrying that
    /// number are routed to it.
    pub fn register_child(self: &Arc<Self>, netnum: i32, child: &Arc<Net>) -> Result<()> {
        if netnum <= 0 || netnum > 0xf {
            bail!("child net number {netnum} out of range");
        }
        child.netnum.store(netnum, Ordering::Release);
        let _ = child.parent.set(Arc::downgrade(self));
        self.children.insert(netnum, child.clone());
        // children share our listener but run their own liveness tasks
        tokio::spawn(heartbeat_send_task(child.clone()));
        tokio::spawn(watchdog_task(child.clone()));
        Ok(())
    }

    pub(crate) fn child(&self, netnum: i32) -> Option<Arc<Net>> {
        self.children.get(&netnum).map(|c| c.value().clone())
    }

    // --- membership ---

    /// Find-or-create a peer record; newly learned hosts get the new-node
    /// callback and a connector.
    pub(crate) fn learn_host(&self, host: &HostRef, port: i32) -> Arc<Peer> {
        let scratch = self.tuning.user_data_buf_size();
        let (peer, added) = self.directory.add(host, port, port > 0, scratch);
        if added {
            debug!(host = %host, port, "learned new host");
            if let Some(cb) = self.callbacks().new_node {
                cb(host, port);
            }
        } else if port > 0 && peer.port.load(Ordering::Acquire) == 0 {
            peer.port.store(port, Ordering::Release);
        }
        peer
    }

    /// HELLO / HELLO-REPLY contents: insert every host we did not know and
    /// dial it, so the mesh closes within one gossip round-trip.
    pub(crate) fn absorb_hostlist(&self, hosts: &[(String, i32)]) {
        for (host, port) in hosts {
            let hostref = intern(host);
            if hostref == self.myhost {
                continue;
            }
            let peer = self.learn_host(&hostref, *port);
            if !peer.is_decommissioned() {
                self.ensure_connector(&peer);
            }
        }
    }

    pub(crate) fn ensure_connector(&self, peer: &Arc<Peer>) {
        if peer.claim_task(peer.connector_bit()) {
            match self.self_arc() {
                Some(net) => {
                    tokio::spawn(connector_task(net, peer.clone()));
                }
                None => peer.connector_bit().store(false, Ordering::Release),
            }
        }
    }

    /// Remove the record; the connector calls this once its peer has fully
    /// drained.
    pub(crate) fn unlink_peer(&self, peer: &Arc<Peer>) {
        if self.directory.remove(&peer.host).is_some() {
            info!(host = %peer.host, "peer removed from directory");
        }
        peer.queue.purge();
        if let Some(qstat) = self.qstat_hooks() {
            qstat.on_clear(&peer.host);
        }
        // anyone parked on an ack for this peer can give up now
        peer.ack_wakeup.notify_waiters();
    }

    pub(crate) fn report_hostdown(&self, peer: &Arc<Peer>) {
        if peer.take_hostdown_report()
            && let Some(cb) = self.callbacks().hostdown
        {
            cb(&peer.host);
        }
    }

    /// Decommission `host` cluster-wide: notify every peer (the victim
    /// included), then tear the local record down after a 2 s grace.
    pub fn decom(&self, host: &str) -> SendResult<()> {
        let target = intern(host);
        if target == self.myhost {
            return Err(SendError::SendToMe);
        }
        if self.directory.lookup(&target).is_none() {
            return Err(SendError::InvalidNode);
        }

        let mut body = Vec::with_capacity(4 + host.len() + 1);
        body.extend_from_slice(&(host.len() as i32 + 1).to_be_bytes());
        body.extend_from_slice(host.as_bytes());
        body.push(0);

        for peer in self.directory.all() {
            if peer.host == self.myhost {
                continue;
            }
            if let Err(e) = self.write_message(
                &peer,
                WireKind::DecomName,
                Bytes::copy_from_slice(&body),
                EnqueueFlags::NODELAY | EnqueueFlags::NO_HELLO_CHECK,
            ) {
                debug!(host = %peer.host, ?e, "could not queue decom notice");
            }
        }
        self.decom_local(host);
        Ok(())
    }

    /// Local half of a decommission: flag now, tear down after the grace
    /// period so in-flight acks can finish.
    pub(crate) fn decom_local(&self, host: &str) {
        let hostref = intern(host);
        if hostref == self.myhost {
            warn!("decom names this node, ignoring");
            return;
        }
        let Some(peer) = self.directory.lookup(&hostref) else {
            return;
        };
        if peer.is_decommissioned() {
            return;
        }
        info!(host = %hostref, "decommissioning");
        self.directory.unsanction(&hostref);
        peer.set_decommissioned();

        let Some(net) = self.self_arc() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            peer.close_connection();
            if !peer.has_connector() {
                net.unlink_peer(&peer);
            }
        });
    }

    // --- send paths ---

    /// Fire-and-forget user message, writer signalled immediately.
    pub fn send(&self, to: &str, usertype: i32, payload: &[u8]) -> SendResult<()> {
        self.send_with_flags(to, usertype, payload, EnqueueFlags::NODELAY)
    }

    /// User message with explicit queueing policy.
    pub fn send_with_flags(
        &self,
        to: &str,
        usertype: i32,
        payload: &[u8],
        flags: EnqueueFlags,
    ) -> SendResult<()> {
        let peer = self.user_send_target(to)?;
        let seqnum = self.next_seqnum();
        let body = self.user_msg_body(usertype, seqnum, false, payload)?;
        self.write_message(&peer, WireKind::UserMsg, body, flags)
    }

    /// One payload to every other known host; per-host outcomes returned.
    pub fn send_to_all(
        &self,
        usertype: i32,
        payload: &[u8],
        flags: EnqueueFlags,
    ) -> Vec<(HostRef, SendResult<()>)> {
        self.directory
            .all()
            .into_iter()
            .filter(|p| p.host != self.myhost)
            .map(|p| {
                let rc = self.send_with_flags(p.host.as_str(), usertype, payload, flags);
                (p.host.clone(), rc)
            })
            .collect()
    }

    /// Fire-and-wait RPC: send with an allocated sequence number and park
    /// until the remote handler acks or the deadline passes.
    pub async fn send_message_payload_ack(
        &self,
        to: &str,
        usertype: i32,
        payload: &[u8],
        wait: Duration,
    ) -> SendResult<AckOutcome> {
        let peer = self.user_send_target(to)?;
        let seqnum = self.next_seqnum();
        ack::register_wait(&peer, seqnum);

        let body = match self.user_msg_body(usertype, seqnum, true, payload) {
            Ok(b) => b,
            Err(e) => {
                ack::remove_wait(&peer, seqnum);
                return Err(e);
            }
        };
        if let Err(e) =
            self.write_message(&peer, WireKind::UserMsg, body, EnqueueFlags::NODELAY)
        {
            ack::remove_wait(&peer, seqnum);
            // the gate code survives; everything else is a write failure
            return Err(if e == SendError::NoHelloYet {
                e
            } else {
                SendError::WriteFail
            });
        }

        ack::wait_for_ack(&peer, seqnum, wait).await
    }

    /// Fire-and-forget with a sequence number but no local wait; the remote
    /// side still sees `waitforack = 0`.
    pub fn send_no_ack(&self, to: &str, usertype: i32, payload: &[u8]) -> SendResult<()> {
        self.send(to, usertype, payload)
    }

    /// Block while any peer's queue sits above `pct` percent (default from
    /// tuning) of either cap.
    pub async fn throttle_wait(&self, pct: Option<u32>) {
        let pct = pct.unwrap_or_else(|| self.tuning.throttle_percent());
        let caps = self.tuning.queue_caps();
        loop {
            let Some(hot) = self.directory.all().into_iter().find(|p| {
                let (count, bytes) = p.queue.depth();
                count > caps.max_queue.saturating_mul(pct as usize) / 100
                    || bytes > caps.max_bytes.saturating_mul(u64::from(pct)) / 100
            }) else {
                return;
            };
            hot.throttle_waiters.fetch_add(1, Ordering::AcqRel);
            hot.queue.throttle_wait(pct, caps).await;
            hot.throttle_waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Control frame to a host already in the directory.
    pub(crate) fn enqueue_control(
        &self,
        host: &HostRef,
        kind: WireKind,
        body: &[u8],
        flags: EnqueueFlags,
    ) -> SendResult<()> {
        let peer = self.directory.lookup(host).ok_or(SendError::InvalidNode)?;
        self.write_message(&peer, kind, Bytes::copy_from_slice(body), flags)
    }

    pub(crate) fn send_hello(&self, peer: &Arc<Peer>) -> SendResult<()> {
        self.send_hostlist(peer, WireKind::Hello)
    }

    pub(crate) fn send_hello_reply(&self, peer: &Arc<Peer>) -> SendResult<()> {
        self.send_hostlist(peer, WireKind::HelloReply)
    }

    fn send_hostlist(&self, peer: &Arc<Peer>, kind: WireKind) -> SendResult<()> {
        let hostlist = self.directory.hostlist();
        let borrowed: Vec<(&str, i32)> = hostlist
            .iter()
            .map(|(h, p)| (h.as_str(), *p))
            .collect();
        let payload = crate::wire::hello::encode_hostlist(&borrowed);
        self.write_message(
            peer,
            kind,
            Bytes::from(payload),
            EnqueueFlags::NODELAY | EnqueueFlags::NO_HELLO_CHECK,
        )
    }

    /// The common enqueue: hello gate, policy bits, queue admission.
    pub(crate) fn write_message(
        &self,
        peer: &Arc<Peer>,
        kind: WireKind,
        payload: Bytes,
        flags: EnqueueFlags,
    ) -> SendResult<()> {
        if !flags.contains(EnqueueFlags::NO_HELLO_CHECK) && !peer.got_hello() {
            return Err(SendError::NoHelloYet);
        }
        if let Some(qstat) = self.qstat_hooks() {
            qstat.on_enqueue(&peer.host, kind as i32);
        }

        let callbacks = self.callbacks();
        let entry = QueueEntry {
            flags,
            enque_time: Instant::now(),
            kind,
            payload,
        };
        peer.queue.enqueue(
            entry,
            self.tuning.queue_caps(),
            callbacks.netcmp.as_deref(),
            peer.host.as_str(),
        )
    }

    fn user_send_target(&self, to: &str) -> SendResult<Arc<Peer>> {
        let host = intern(to);
        let peer = self.directory.lookup(&host).ok_or(SendError::InvalidNode)?;
        if host == self.myhost {
            return Err(SendError::SendToMe);
        }
        if peer.is_decommissioned() {
            return Err(SendError::InvalidNode);
        }
        if peer.is_really_closed() {
            return Err(SendError::NoSock);
        }
        if peer.is_closed() {
            return Err(SendError::Closed);
        }
        Ok(peer)
    }

    fn user_msg_body(
        &self,
        usertype: i32,
        seqnum: i32,
        waitforack: bool,
        payload: &[u8],
    ) -> SendResult<Bytes> {
        if !(0..=MAX_USER_TYPE as i32).contains(&usertype) {
            return Err(SendError::Internal);
        }
        let hdr = UserMsgHeader::new(usertype, seqnum, waitforack, payload.len() as i32);
        let mut body = Vec::new();
        body.try_reserve_exact(hdr.as_bytes().len() + payload.len())
            .map_err(|_| SendError::MallocFail)?;
        body.extend_from_slice(hdr.as_bytes());
        body.extend_from_slice(payload);
        Ok(Bytes::from(body))
    }

    fn next_seqnum(&self) -> i32 {
        self.seqnum.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    // --- inbound helpers ---

    pub(crate) fn qstat_hooks(&self) -> Option<Arc<dyn QueueStatHooks>> {
        self.callbacks().qstat
    }

    pub(crate) fn translate_node(&self, node: i32) -> Option<String> {
        self.callbacks().node_to_host.and_then(|f| f(node))
    }

    pub(crate) fn net_delay_for(&self, host: &HostRef) -> Option<Duration> {
        self.callbacks().net_delay.and_then(|f| f(host))
    }

    pub(crate) fn log_unknown_usertype(&self, usertype: i32) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let last = self.last_unknown_log.load(Ordering::Acquire);
        if now != last
            && self
                .last_unknown_log
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            warn!(usertype, "no handler registered for user message type");
        }
    }

    /// Resolve a hostname: static overrides first, then the system resolver.
    pub(crate) async fn resolve_host(&self, name: &str) -> Option<IpAddr> {
        if let Some(ip) = read_guard(&self.overrides).get(name) {
            return Some(*ip);
        }
        let mut addrs = tokio::net::lookup_host((name, 0u16)).await.ok()?;
        addrs.next().map(|a| a.ip())
    }

    pub(crate) fn run_thread_start(&self) {
        if let Some(cb) = self.callbacks().start_thread {
            cb();
        }
    }

    pub(crate) fn run_thread_stop(&self) {
        if let Some(cb) = self.callbacks().stop_thread {
            cb();
        }
    }

    // --- telemetry ---

    pub fn snapshot(&self) -> NetSnapshot {
        NetSnapshot {
            hostname: self.myhost.as_str().to_string(),
            port: self.myport.load(Ordering::Acquire),
            peers: self.directory.snapshot(),
            lsn: self.callbacks().getlsn.map(|f| f()),
        }
    }

    /// Configured members currently connected with gossip complete.
    pub fn sanctioned_and_connected(&self) -> Vec<HostRef> {
        self.directory.sanctioned_and_connected()
    }
}

impl std::fmt::Debug for Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Net")
            .field("host", &self.myhost)
            .field("port", &self.myport.load(Ordering::Relaxed))
            .field("peers", &self.directory.len())
            .finish_non_exhaustive()
    }
}

/// Heartbeat every peer on the send interval. HEAD keeps a heartbeat from
/// queueing behind bulk data, NODUPE keeps it from stacking up, NOLIMIT
/// lets it through a full queue.
async fn heartbeat_send_task(net: Arc<Net>) {
    net.run_thread_start();
    loop {
        let period = Duration::from_secs(net.tuning.heartbeat_send_time().max(1));
        tokio::select! {
            _ = net.exit_token().cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        for peer in net.directory.all() {
            if peer.host == *net.my_host() || peer.is_decommissioned() {
                continue;
            }
            let _ = net.write_message(
                &peer,
                WireKind::Heartbeat,
                Bytes::new(),
                EnqueueFlags::HEAD
                    | EnqueueFlags::NODUPE
                    | EnqueueFlags::NODELAY
                    | EnqueueFlags::NOLIMIT
                    | EnqueueFlags::NO_HELLO_CHECK,
            );
        }
    }
    net.run_thread_stop();
}

/// Once a second: kill links that have been silent past the check time
/// (unless a handler is running on them), and keep our port-mux
/// registration fresh.
async fn watchdog_task(net: Arc<Net>) {
    net.run_thread_start();
    let mut last_register = Instant::now();
    loop {
        tokio::select! {
            _ = net.exit_token().cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let check = net.tuning.heartbeat_check_time() as i64;
        for peer in net.directory.all() {
            if peer.host == *net.my_host() || !peer.is_connected() {
                continue;
            }
            if peer.running_user_func.load(Ordering::Acquire) != 0 {
                continue;
            }
            let idle = peer.idle_secs();
            if idle > check {
                warn!(host = %peer.host, idle, "no traffic past the check time, closing link");
                if let Some(suffix) = peer.current_subnet() {
                    subnet::mark_bad(&suffix);
                }
                net.report_hostdown(&peer);
                peer.close_connection();
            }
        }

        let interval = Duration::from_secs(net.tuning.portmux_register_interval());
        if last_register.elapsed() >= interval {
            last_register = Instant::now();
            if let Some(mux) = net.portmux() {
                if let Some(cb) = net.callbacks().hello {
                    cb();
                }
                match mux.register(&net.app, &net.service, &net.instance) {
                    Ok(port) => {
                        let mine = net.myport.load(Ordering::Acquire);
                        if i32::from(port) != mine {
                            // sockpool has the old port cached everywhere
                            error!(
                                registered = port,
                                listening = mine,
                                "port-mux re-registration moved our port; aborting"
                            );
                            std::process::abort();
                        }
                    }
                    Err(e) => warn!(?e, "port-mux re-registration failed"),
                }
            }
        }
    }
    net.run_thread_stop();
}

fn read_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn write_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_net(name: &str) -> Arc<Net> {
        let cfg = NetConfig::for_host(name, 9000);
        Net::create(&cfg).expect("create")
    }

    #[test]
    fn send_to_unknown_host_is_invalid_node() {
        let net = test_net("net-test-a");
        assert_eq!(
            net.send("nobody-at-all", 1, b"x").expect_err("unknown"),
            SendError::InvalidNode
        );
    }

    #[test]
    fn send_to_self_is_send_to_me() {
        let net = test_net("net-test-b");
        assert_eq!(
            net.send("net-test-b", 1, b"x").expect_err("self"),
            SendError::SendToMe
        );
    }

    #[test]
    fn send_without_socket_is_no_sock() {
        let net = test_net("net-test-c");
        let host = intern("net-test-c-peer");
        net.learn_host(&host, 9001);
        assert_eq!(
            net.send("net-test-c-peer", 1, b"x").expect_err("no sock"),
            SendError::NoSock
        );
    }

    #[test]
    fn user_handler_table_bounds() {
        let net = test_net("net-test-d");
        let handler: UserHandler = Arc::new(|_, _| {});
        net.register_user_handler(0, "zero", handler.clone())
            .expect("slot 0");
        net.register_user_handler(MAX_USER_TYPE, "max", handler.clone())
            .expect("slot max");
        assert!(
            net.register_user_handler(MAX_USER_TYPE + 1, "over", handler)
                .is_err()
        );
        assert!(net.userfunc(0).is_some());
        assert!(net.userfunc(MAX_USER_TYPE).is_some());
        assert!(net.userfunc(MAX_USER_TYPE + 1).is_none());
    }

    #[test]
    fn seqnums_are_distinct() {
        let net = test_net("net-test-e");
        let a = net.next_seqnum();
        let b = net.next_seqnum();
        assert_ne!(a, b);
    }
}
