// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The accept path: one listener, one short-lived dispatcher per inbound
//! socket.
//!
//! The dispatcher polls for the first byte. A zero byte is ours: read the
//! connect frame, validate it, route to a child Net if addressed, and swing
//! the socket onto the peer record. Anything else is an application socket
//! and is handed to the registered callback; `@` marks the admin variant,
//! restricted to loopback unless configured otherwise.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};
use tracing::{info, warn};

use crate::{
    conn::{connector::connector_task, install_stream, read_exact_or_cancel},
    intern::intern,
    net::Net,
    peer::Peer,
    subnet,
    wire::{
        connect::{CONNECT_MSG_LEN, ConnectMsg, RawConnectMsg},
        header::{HOST_FIELD_LEN, HostField, parse_host_field, run_to_string},
        kind::CONNECT_FRAME,
    },
};

const ACCEPT_SOCK_BUF: usize = 8 * 1024 * 1024;

pub(crate) async fn accept_task(net: Arc<Net>, listener: TcpListener) {
    net.run_thread_start();
    loop {
        tokio::select! {
            _ = net.exit_token().cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let net = net.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatch_inbound(net, stream, addr).await {
                            info!(%addr, ?e, "inbound connection dropped");
                        }
                    });
                }
                Err(e) => {
                    warn!(?e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    net.run_thread_stop();
}

async fn dispatch_inbound(net: Arc<Net>, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
    stream.set_nodelay(true)?;
    {
        let sock = socket2::SockRef::from(&stream);
        sock.set_keepalive(true)?;
        sock.set_send_buffer_size(ACCEPT_SOCK_BUF)?;
        sock.set_recv_buffer_size(ACCEPT_SOCK_BUF)?;
        sock.set_linger(None)?;
    }

    let mut first = [0u8; 1];
    let poll = Duration::from_millis(net.tuning().netpoll_ms());
    tokio::time::timeout(poll, stream.read_exact(&mut first)).await??;

    if first[0] != CONNECT_FRAME {
        return route_appsock(&net, stream, addr, first[0]);
    }

    let msg = read_connect_frame(&net, &mut stream).await?;
    if msg.wants_tls() {
        bail!("peer requested tls, but tls is not configured here");
    }
    if msg.to_host != net.my_host().as_str() || msg.to_port != net.advertised_port() {
        bail!(
            "connect frame for {}:{}, but I am {}:{}",
            msg.to_host,
            msg.to_port,
            net.my_host(),
            net.advertised_port()
        );
    }
    if let Some(allow) = net.callbacks().allow
        && !allow(&msg.my_host)
    {
        bail!("connection from {} is not allowed", msg.my_host);
    }

    let netnum = msg.netnum();
    let target = if netnum != 0 && netnum != net.netnum() {
        match net.child(netnum) {
            Some(child) => child,
            None => bail!("connect frame for unregistered child net {netnum}"),
        }
    } else {
        net
    };
    accept_handle_new_host(target, &msg.my_host, msg.sender_port(), stream).await
}

/// Read the fixed 48-byte frame plus long-name runs (my-name first).
async fn read_connect_frame(net: &Net, stream: &mut TcpStream) -> Result<ConnectMsg> {
    let token = net.exit_token();
    let mut raw = [0u8; CONNECT_MSG_LEN];
    read_exact_or_cancel(stream, &mut raw, token).await?;
    let raw = RawConnectMsg::parse(&raw)?;

    let my_host = resolve_field(stream, &raw.my_host, net).await?;
    let to_host = resolve_field(stream, &raw.to_host, net).await?;

    Ok(ConnectMsg {
        to_host,
        to_port: raw.to_port.get(),
        flags: raw.flags.get(),
        my_host,
        my_port: raw.my_port.get(),
    })
}

async fn resolve_field(
    stream: &mut TcpStream,
    slot: &[u8; HOST_FIELD_LEN],
    net: &Net,
) -> Result<String> {
    match parse_host_field(slot)? {
        HostField::Inline(name) => Ok(name),
        HostField::Long(runlen) => {
            let mut run = vec![0u8; runlen];
            read_exact_or_cancel(stream, &mut run, net.exit_token()).await?;
            run_to_string(&run)
        }
    }
}

fn route_appsock(net: &Net, stream: TcpStream, addr: SocketAddr, byte: u8) -> Result<()> {
    if byte == b'@' {
        if !addr.ip().is_loopback() && !net.tuning().allow_remote_admin() {
            bail!("admin appsock refused from non-loopback {addr}");
        }
        let Some(handler) = net.callbacks().admin_appsock else {
            bail!("no admin appsock handler registered");
        };
        handler(stream, byte);
        return Ok(());
    }
    let Some(handler) = net.callbacks().appsock else {
        bail!("no appsock handler registered");
    };
    handler(stream, byte);
    Ok(())
}

/// Find-or-create the peer, retire its old socket if one is live, swap the
/// new one in, and make sure a connector exists to own the record.
async fn accept_handle_new_host(
    net: Arc<Net>,
    host: &str,
    port: i32,
    stream: TcpStream,
) -> Result<()> {
    let hostref = intern(host);
    if hostref == *net.my_host() {
        bail!("connect frame claims to be from myself");
    }

    let peer = net.learn_host(&hostref, port);
    if port > 0 {
        peer.port
            .store(port, std::sync::atomic::Ordering::Release);
    }
    if peer.is_decommissioned() {
        bail!("peer {} is decommissioned", hostref);
    }

    retire_old_socket(&peer).await;

    let local_ip = stream.local_addr().ok().map(|a| a.ip());
    let inbound_subnet = subnet::match_local_subnet(&net, local_ip).await;
    if let Some(suffix) = &inbound_subnet
        && subnet::is_disabled(suffix)
    {
        bail!("inbound subnet {suffix} is administratively disabled");
    }

    install_stream(&net, &peer, stream, inbound_subnet);

    // become the connector when the record has none
    if peer.claim_task(peer.connector_bit()) {
        tokio::spawn(connector_task(net, peer));
    }
    Ok(())
}

/// A replacement socket arrived while the old one is still live: close the
/// old one and wait its IO tasks out.
async fn retire_old_socket(peer: &Arc<Peer>) {
    if !peer.has_io_tasks() && !peer.is_connected() {
        return;
    }
    peer.close_connection();
    let mut polls = 0u32;
    while peer.has_io_tasks() {
        tokio::time::sleep(Duration::from_millis(100)).await;
        polls += 1;
        if polls % 10 == 0 {
            warn!(host = %peer.host, polls, "old io tasks still draining before socket swap");
        }
    }
}
