// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-peer reader task: frame parse loop and dispatch table.
//!
//! Every successfully read header refreshes the peer's liveness timestamp.
//! IO errors flip the distress flag (one log line, cleared on recovery) and
//! tear down only this socket. Malformed frames that lose the stream
//! framing (impossible ack payload length, bad length escapes) drop the
//! connection; an unknown-but-well-framed kind is logged and skipped.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Instant,
};

use anyhow::{Result, bail};
use tokio::{io::BufReader, net::tcp::OwnedReadHalf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    ack::{AckState, complete_wait},
    callbacks::MAX_USER_TYPE,
    conn::read_exact_or_cancel,
    net::Net,
    peer::{IoTask, Peer},
    wire::{
        header::{HostField, RawWireHeader, WIRE_HEADER_LEN, WireHeader, parse_host_field, run_to_string},
        kind::WireKind,
        user::{
            ACK_LEN, ACK_PAYLOAD_HEADER_LEN, AckMsg, AckPayloadHeader, USER_MSG_HEADER_LEN,
            UserMsgHeader,
        },
    },
};

type Stream = BufReader<OwnedReadHalf>;

pub(crate) async fn reader_task(
    net: Arc<Net>,
    peer: Arc<Peer>,
    rd: OwnedReadHalf,
    token: CancellationToken,
) {
    net.run_thread_start();
    if let Some(qstat) = net.qstat_hooks() {
        qstat.on_reader_attach(&peer.host);
    }
    let mut rd = BufReader::with_capacity(net.tuning().bufsz(), rd);

    loop {
        if net.is_exiting()
            || peer.is_closed()
            || peer.is_decommissioned()
            || token.is_cancelled()
        {
            break;
        }

        let header = match read_frame_header(&mut rd, &token).await {
            Ok(h) => h,
            Err(_) => {
                // a read failing because we are closing is not distress
                let teardown =
                    net.is_exiting() || peer.is_closed() || token.is_cancelled();
                if !teardown && peer.set_distress(true) {
                    warn!(host = %peer.host, "entering distress mode");
                }
                break;
            }
        };
        if peer.set_distress(false) {
            info!(host = %peer.host, "leaving distress mode");
        }
        peer.touch();

        let Some(kind) = WireKind::from_i32(header.kind) else {
            warn!(host = %peer.host, kind = header.kind, "unknown wire message type");
            continue;
        };

        let ok = match kind {
            // the timestamp refresh above is all a heartbeat asks for
            WireKind::Heartbeat => Ok(()),
            WireKind::Hello => process_hello(&net, &peer, &mut rd, &token, true).await,
            WireKind::HelloReply => {
                process_hello(&net, &peer, &mut rd, &token, false).await
            }
            WireKind::Decom => process_decom(&net, &mut rd, &token).await,
            WireKind::DecomName => process_decom_name(&net, &mut rd, &token).await,
            WireKind::UserMsg => process_user_msg(&net, &peer, &mut rd, &token).await,
            WireKind::Ack => process_ack(&peer, &mut rd, &token).await,
            WireKind::AckPayload => process_payload_ack(&peer, &mut rd, &token).await,
        };
        if let Err(e) = ok {
            warn!(host = %peer.host, kind = ?kind, ?e, "dropping connection");
            break;
        }
    }

    peer.close_connection();
    peer.io_task_exited(IoTask::Reader);
    if !net.is_exiting() && !peer.is_decommissioned() {
        net.report_hostdown(&peer);
    }
    net.run_thread_stop();
}

/// Read the fixed header plus any long-name runs (from-name first).
async fn read_frame_header(rd: &mut Stream, token: &CancellationToken) -> Result<WireHeader> {
    let mut raw = [0u8; WIRE_HEADER_LEN];
    read_exact_or_cancel(rd, &mut raw, token).await?;
    let hdr = RawWireHeader::parse(&raw)?;

    let from_host = resolve_host(rd, &hdr.fromhost, token).await?;
    let to_host = resolve_host(rd, &hdr.tohost, token).await?;

    Ok(WireHeader {
        from_host,
        from_port: hdr.fromport.get(),
        to_host,
        to_port: hdr.toport.get(),
        kind: hdr.kind.get(),
    })
}

async fn resolve_host(
    rd: &mut Stream,
    slot: &[u8; crate::wire::header::HOST_FIELD_LEN],
    token: &CancellationToken,
) -> Result<String> {
    match parse_host_field(slot)? {
        HostField::Inline(name) => Ok(name),
        HostField::Long(runlen) => {
            let mut run = vec![0u8; runlen];
            read_exact_or_cancel(rd, &mut run, token).await?;
            run_to_string(&run)
        }
    }
}

/// HELLO / HELLO-REPLY: absorb the sender's host list; a decode problem is
/// a rejected hello, not an IO error, so only read failures propagate.
async fn process_hello(
    net: &Arc<Net>,
    peer: &Arc<Peer>,
    rd: &mut Stream,
    token: &CancellationToken,
    reply: bool,
) -> Result<()> {
    let mut szbuf = [0u8; 4];
    read_exact_or_cancel(rd, &mut szbuf, token).await?;
    let datasz = i32::from_be_bytes(szbuf);
    if !(10..=1024 * 1024).contains(&datasz) {
        bail!("hello datasz {datasz} out of range");
    }
    let datasz = datasz as usize;
    let mut payload = vec![0u8; datasz];
    payload[..4].copy_from_slice(&szbuf);
    read_exact_or_cancel(rd, &mut payload[4..], token).await?;

    match crate::wire::hello::decode_hostlist(&payload) {
        Ok(hosts) => {
            net.absorb_hostlist(&hosts);
            peer.set_got_hello();
            if reply {
                let _ = net.send_hello_reply(peer);
            }
        }
        Err(e) => warn!(host = %peer.host, ?e, "rejected hello"),
    }
    Ok(())
}

/// Legacy numeric decom: translate through the registered table; a missing
/// entry is logged and ignored, not treated as a violation.
async fn process_decom(net: &Arc<Net>, rd: &mut Stream, token: &CancellationToken) -> Result<()> {
    let mut buf = [0u8; 4];
    read_exact_or_cancel(rd, &mut buf, token).await?;
    let node = i32::from_be_bytes(buf);

    match net.translate_node(node) {
        Some(host) => net.decom_local(&host),
        None => warn!(node, "decom for unknown numeric node, ignoring"),
    }
    Ok(())
}

async fn process_decom_name(
    net: &Arc<Net>,
    rd: &mut Stream,
    token: &CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; 4];
    read_exact_or_cancel(rd, &mut buf, token).await?;
    let namelen = i32::from_be_bytes(buf);
    if !(1..=4096).contains(&namelen) {
        bail!("impossible decom name length {namelen}");
    }
    let mut name = vec![0u8; namelen as usize];
    read_exact_or_cancel(rd, &mut name, token).await?;
    let host = run_to_string(&name)?;
    net.decom_local(&host);
    Ok(())
}

/// USER_MSG: payloads below the scratch threshold land in the per-peer
/// buffer and reach the handler without an allocation.
async fn process_user_msg(
    net: &Arc<Net>,
    peer: &Arc<Peer>,
    rd: &mut Stream,
    token: &CancellationToken,
) -> Result<()> {
    let mut hb = [0u8; USER_MSG_HEADER_LEN];
    read_exact_or_cancel(rd, &mut hb, token).await?;
    let uh = UserMsgHeader::parse(&hb)?;

    let datalen = uh.datalen.get();
    if datalen < 0 {
        bail!("negative user message length {datalen}");
    }
    let datalen = datalen as usize;

    let mut scratch;
    let mut heap;
    let data: &[u8] = if datalen < net.tuning().user_data_buf_size() {
        scratch = peer.scratch.lock().await;
        scratch.resize(datalen, 0);
        read_exact_or_cancel(rd, &mut scratch[..datalen], token).await?;
        &scratch[..datalen]
    } else {
        heap = vec![0u8; datalen];
        read_exact_or_cancel(rd, &mut heap, token).await?;
        &heap
    };

    let usertype = uh.usertype.get();
    let func = if (0..=MAX_USER_TYPE as i32).contains(&usertype) {
        net.userfunc(usertype as usize)
    } else {
        None
    };

    let Some(func) = func else {
        net.log_unknown_usertype(usertype);
        return Ok(());
    };

    let ack = AckState::new(
        net.clone(),
        peer.host.clone(),
        uh.seqnum.get(),
        uh.waitforack.get() != 0,
    );

    peer.running_user_func.fetch_add(1, Ordering::AcqRel);
    let started = Instant::now();
    (func.handler)(&ack, data);
    peer.user_func_micros
        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    peer.user_msg_count.fetch_add(1, Ordering::Relaxed);
    peer.running_user_func.fetch_sub(1, Ordering::AcqRel);

    Ok(())
}

async fn process_ack(peer: &Arc<Peer>, rd: &mut Stream, token: &CancellationToken) -> Result<()> {
    let mut buf = [0u8; ACK_LEN];
    read_exact_or_cancel(rd, &mut buf, token).await?;
    let ack = AckMsg::parse(&buf)?;
    complete_wait(peer, ack.seqnum.get(), ack.outrc.get(), None);
    Ok(())
}

async fn process_payload_ack(
    peer: &Arc<Peer>,
    rd: &mut Stream,
    token: &CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; ACK_PAYLOAD_HEADER_LEN];
    read_exact_or_cancel(rd, &mut buf, token).await?;
    let hdr = AckPayloadHeader::parse(&buf)?;

    let mut payload = vec![0u8; hdr.paylen.get() as usize];
    read_exact_or_cancel(rd, &mut payload, token).await?;
    complete_wait(peer, hdr.seqnum.get(), hdr.outrc.get(), Some(payload));
    Ok(())
}
