// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-peer connection lifecycle: the connector, reader, and writer tasks,
//! plus the accept path that swings inbound sockets onto peer records.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    net::Net,
    peer::{ConnHandle, Peer},
};

pub(crate) mod accept;
pub(crate) mod connector;
pub(crate) mod reader;
pub(crate) mod writer;

/// Install a freshly established socket on the peer and spawn its IO tasks.
///
/// The stream is split; each half is owned by its task, so teardown is
/// purely token-driven and the last task out closes the socket by dropping
/// its half.
pub(crate) fn install_stream(
    net: &Arc<Net>,
    peer: &Arc<Peer>,
    stream: TcpStream,
    subnet: Option<Arc<str>>,
) {
    let token = CancellationToken::new();
    let local_addr = stream.local_addr().ok();
    let peer_addr = stream.peer_addr().ok();
    if let Some(addr) = peer_addr {
        peer.set_addr(addr);
    }

    let (rd, wr) = stream.into_split();
    peer.install_connection(ConnHandle {
        token: token.clone(),
        subnet: subnet.clone(),
        local_addr,
        peer_addr,
    });
    peer.set_subnet(subnet);

    if peer.claim_task(peer.reader_bit()) {
        tokio::spawn(reader::reader_task(
            net.clone(),
            peer.clone(),
            rd,
            token.clone(),
        ));
    } else {
        error!(host = %peer.host, "reader already present on a fresh socket");
    }
    if peer.claim_task(peer.writer_bit()) {
        tokio::spawn(writer::writer_task(net.clone(), peer.clone(), wr, token));
    } else {
        error!(host = %peer.host, "writer already present on a fresh socket");
    }
}

/// SO_KEEPALIVE via socket2; tokio itself only exposes nodelay.
pub(crate) fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)
}

/// `read_exact` that aborts when the socket token is cancelled; the token
/// stands in for `shutdown(fd, RDWR)`.
pub(crate) async fn read_exact_or_cancel<R>(
    r: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("read cancelled")),
        res = r.read_exact(buf) => {
            res?;
            Ok(())
        }
    }
}

/// `write_all` with the same cancellation behavior.
pub(crate) async fn write_all_or_cancel<W>(
    w: &mut W,
    buf: &[u8],
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("write cancelled")),
        res = w.write_all(buf) => {
            res?;
            Ok(())
        }
    }
}
