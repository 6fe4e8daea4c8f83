// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The subscription socket: one per remote server.
//!
//! A dedicated receive thread loops on reassembly and invokes the single
//! registered callback with each decoded reply; the acknowledgment goes back
//! inside the receive path. Shutdown is cooperative: the exit event plus a
//! short socket timeout, no thread kill.

use crate::access::{decode_reply, xact, Reply};
use crate::error::{Error, Result};
use crate::proto::Request;
use crate::util::ExitEvent;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) type Callback = Box<dyn Fn(Reply) + Send + Sync + 'static>;

pub(crate) struct SubscriptionSocket {
    server: SocketAddr,
    socket: Arc<UdpSocket>,
    exit: ExitEvent,
    thread: Option<JoinHandle<()>>,
}

impl SubscriptionSocket {
    /// Bind a fresh socket and start the receive thread.
    pub fn start(server: SocketAddr, callback: Callback) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0")?);
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let exit = ExitEvent::new();

        let thread_socket = Arc::clone(&socket);
        let thread_exit = exit.clone();
        let thread = std::thread::Builder::new()
            .name(format!("sub-{server}"))
            .spawn(move || receive_loop(&thread_socket, server, &thread_exit, &callback))
            .map_err(Error::Io)?;

        Ok(Self {
            server,
            socket,
            exit,
            thread: Some(thread),
        })
    }

    /// Ship a request (subscribe/unsubscribe) from this socket, so the
    /// server keys its subscriber entry by this socket's address.
    pub fn send_request(&self, request: &Request) -> Result<()> {
        xact::send_request(&self.socket, self.server, request)
    }

    /// Send the unsubscribe, stop the thread, drop the socket.
    pub fn shutdown(mut self, unsubscribe: &Request) {
        if let Err(e) = self.send_request(unsubscribe) {
            log::warn!("unsubscribe to {} failed: {e}", self.server);
        }
        self.exit.trigger();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        log::info!("subscription socket for {} closed", self.server);
    }
}

impl Drop for SubscriptionSocket {
    fn drop(&mut self) {
        self.exit.trigger();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn receive_loop(
    socket: &UdpSocket,
    server: SocketAddr,
    exit: &ExitEvent,
    callback: &Callback,
) {
    log::info!("receiving thread started for {server}");
    while !exit.is_set() {
        match xact::receive_reply(socket, server) {
            Ok(value) => match decode_reply(&value) {
                Ok(reply) if !reply.is_empty() => callback(reply),
                Ok(_) => log::debug!("empty data from {server}"),
                Err(e) => log::warn!("undecodable publication from {server}: {e}"),
            },
            Err(Error::Timeout) => {}
            Err(Error::Delivery(msg)) => {
                log::warn!("in subscription socket for {server}: {msg}");
            }
            Err(e) => {
                log::warn!("in subscription socket for {server}: {e}");
            }
        }
    }
    log::info!("receiving thread stopped for {server}");
}
