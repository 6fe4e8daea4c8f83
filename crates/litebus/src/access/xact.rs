// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Low-level client transaction: send one request, reassemble the chunked
//! reply, acknowledge it, decode it.

use crate::chunk::{Reassembler, Step};
use crate::codec::{self, Value};
use crate::config::{ACK, RECV_BUF_SIZE, WARN_PREFIX};
use crate::error::{Error, Result};
use crate::proto::Request;
use crate::util::crop;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Ship a request datagram; one retry after a short sleep on a transient
/// send error.
pub(crate) fn send_request(
    socket: &UdpSocket,
    server: SocketAddr,
    request: &Request,
) -> Result<()> {
    let buf = codec::encode(&request.to_value());
    if let Err(first) = socket.send_to(&buf, server) {
        log::warn!("send to {server} failed ({first}), retrying once");
        std::thread::sleep(Duration::from_millis(100));
        socket.send_to(&buf, server)?;
    }
    Ok(())
}

/// Receive one chunked reply, asking for retransmits as gaps surface, then
/// acknowledge and decode it. An `"ERR.LS"` string reply becomes
/// [`Error::Remote`]; a `"WARNING"` string is logged and passed through.
pub(crate) fn receive_reply(socket: &UdpSocket, server: SocketAddr) -> Result<Value> {
    let mut reassembler = Reassembler::new();
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let (n, _from) = socket.recv_from(&mut buf)?;
        match reassembler.push(&buf[..n]) {
            Step::NeedMore => {}
            Step::Complete => break,
            Step::Retransmit { offset, size } => {
                let retransmit = Request::retransmit(offset, size);
                log::info!("asking to retransmit ({offset},{size}) from {server}");
                send_request(socket, server, &retransmit)?;
            }
            Step::Failed(msg) => return Err(Error::Delivery(msg)),
        }
    }
    // Acknowledge so the server clears its outstanding-delivery state.
    if let Err(e) = socket.send_to(ACK, server) {
        log::warn!("ACK to {server} failed: {e}");
    }

    let data = reassembler.assemble();
    let value = codec::decode(&data)?;
    if let Some(s) = value.as_str() {
        if s.starts_with("ERR") {
            return Err(Error::Remote(s.to_string()));
        }
        if s.starts_with(WARN_PREFIX) {
            log::warn!("{}", crop(s, 300));
        }
    }
    Ok(value)
}

/// One full request/reply exchange on a caller-provided socket.
pub(crate) fn transact(
    socket: &UdpSocket,
    server: SocketAddr,
    request: &Request,
) -> Result<Value> {
    send_request(socket, server, request)?;
    receive_reply(socket, server)
}
