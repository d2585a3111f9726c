// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Application hooks: the user-handler table and the optional callbacks a
//! controller registers before starting the Net.
//!
//! Handlers run inline on the reader task; anything long-running should
//! copy its input and spawn.

use std::{cmp::Ordering, sync::Arc, time::Duration};

use tokio::net::TcpStream;

use crate::{ack::AckState, intern::HostRef};

/// Highest valid user message type; the handler table has
/// `MAX_USER_TYPE + 1` slots.
pub const MAX_USER_TYPE: usize = 255;

/// Inbound user-message handler. `data` borrows the per-peer scratch
/// buffer; copy it out before returning if it must outlive the call.
pub type UserHandler = Arc<dyn Fn(&AckState, &[u8]) + Send + Sync>;

/// Accept/refuse an inbound connection by hostname.
pub type AllowFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
/// A host was newly learned (config, accept, or gossip).
pub type NewNodeFn = Arc<dyn Fn(&HostRef, i32) + Send + Sync>;
/// A previously live host lost its socket.
pub type HostDownFn = Arc<dyn Fn(&HostRef) + Send + Sync>;
/// Periodic liveness ping toward the port-mux daemon.
pub type HelloFn = Arc<dyn Fn() + Send + Sync>;
/// Non-zero first byte on an accepted socket: hand the stream over.
pub type AppSockFn = Arc<dyn Fn(TcpStream, u8) + Send + Sync>;
/// Report the current log sequence number for status output.
pub type GetLsnFn = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;
/// `INORDER` comparator over two queued frame bodies.
pub type NetCmpFn = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;
/// Translate a legacy numeric node id into a hostname.
pub type NodeToHostFn = Arc<dyn Fn(i32) -> Option<String> + Send + Sync>;
/// Artificial send delay keyed by destination (data-center affinity).
pub type NetDelayFn = Arc<dyn Fn(&HostRef) -> Option<Duration> + Send + Sync>;
/// Invoked at the start/end of every long-lived task.
pub type ThreadHookFn = Arc<dyn Fn() + Send + Sync>;

/// Queue statistics plugin; every hook is optional behavior, the core only
/// reports events.
pub trait QueueStatHooks: Send + Sync {
    fn on_enqueue(&self, host: &HostRef, kind: i32) {
        let _ = (host, kind);
    }
    fn on_clear(&self, host: &HostRef) {
        let _ = host;
    }
    fn on_reader_attach(&self, host: &HostRef) {
        let _ = host;
    }
}

/// One registered user message handler.
#[derive(Clone)]
pub struct UserFunc {
    pub name: &'static str,
    pub handler: UserHandler,
}

/// Everything a controller may register. All fields optional; the Net
/// behaves sensibly with none of them set.
#[derive(Default, Clone)]
pub struct Callbacks {
    pub allow: Option<AllowFn>,
    pub new_node: Option<NewNodeFn>,
    pub hostdown: Option<HostDownFn>,
    pub hello: Option<HelloFn>,
    pub appsock: Option<AppSockFn>,
    pub admin_appsock: Option<AppSockFn>,
    pub getlsn: Option<GetLsnFn>,
    pub netcmp: Option<NetCmpFn>,
    pub node_to_host: Option<NodeToHostFn>,
    pub net_delay: Option<NetDelayFn>,
    pub qstat: Option<Arc<dyn QueueStatHooks>>,
    pub start_thread: Option<ThreadHookFn>,
    pub stop_thread: Option<ThreadHookFn>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("allow", &self.allow.is_some())
            .field("new_node", &self.new_node.is_some())
            .field("hostdown", &self.hostdown.is_some())
            .field("netcmp", &self.netcmp.is_some())
            .finish_non_exhaustive()
    }
}
