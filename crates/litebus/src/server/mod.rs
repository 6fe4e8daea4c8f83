// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The litebus server: one UDP socket, a set of devices, and the broker
//! behind them.
//!
//! Threads of a running server:
//! - the caller's thread in [`Server::run`], looping on `recv_from` with a
//!   short timeout and dispatching requests synchronously
//! - the heartbeat thread (statistics/perf/clientsInfo publication)
//! - the device polling thread
//! - the ack service thread (beacon re-announce)
//!
//! All broker state lives on [`ServerShared`], owned by the `Server` that
//! `main` holds; devices reach it through a weak back-reference.

pub(crate) mod ack;
pub(crate) mod broker;
pub(crate) mod sysdev;

pub(crate) use broker::publish_device;

use crate::config::{ServerConfig, RECV_BUF_SIZE, SERVER_RECV_TIMEOUT};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::util::{local_ip, ExitEvent};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Advisory performance counters, incremented without locks.
pub(crate) struct Perf {
    sends: AtomicU64,
    bytes: AtomicU64,
    send_micros: AtomicU64,
    pub retransmits: AtomicU64,
    pub items_lost: AtomicU64,
    pub dropped: AtomicU64,
}

pub(crate) struct PerfSnapshot {
    pub sends: u64,
    pub mbytes: f64,
    pub seconds: f64,
    pub retransmits: u64,
    pub items_lost: u64,
    pub dropped: u64,
}

impl Perf {
    fn new() -> Self {
        Self {
            sends: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            send_micros: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            items_lost: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record_send(&self, bytes: usize, elapsed: Duration) {
        self.sends.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.send_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            sends: self.sends.load(Ordering::Relaxed),
            mbytes: self.bytes.load(Ordering::Relaxed) as f64 * 1e-6,
            seconds: self.send_micros.load(Ordering::Relaxed) as f64 * 1e-6,
            retransmits: self.retransmits.load(Ordering::Relaxed),
            items_lost: self.items_lost.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the broker, the background threads and the devices.
pub(crate) struct ServerShared {
    pub cfg: ServerConfig,
    pub host: String,
    pub socket: UdpSocket,
    pub devices: Vec<Arc<Device>>,
    pub acks: ack::AckTracker,
    pub perf: Perf,
    pub exit: ExitEvent,
    /// Guards the whole send-and-register sequence of one reply.
    pub send_lock: Mutex<()>,
    /// Serializes `publish()` across devices.
    pub publish_lock: Mutex<()>,
    /// Set when the subscriber inventory changes; the heartbeat consumes it.
    pub clients_dirty: AtomicBool,
    /// Identity of the current requester; the LDO shows the previous one.
    pub last_pid: Mutex<String>,
}

impl ServerShared {
    pub fn device(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.iter().find(|d| d.name() == name).cloned()
    }
}

/// A litebus server hosting the `server` device plus the caller's devices.
pub struct Server {
    shared: Arc<ServerShared>,
    addr: SocketAddr,
}

impl Server {
    /// Bind the socket, build the `server` device and wire every device to
    /// the broker. Startup failures (bad interface, bind, duplicate device
    /// names) are fatal.
    pub fn new(cfg: ServerConfig, devices: Vec<Arc<Device>>) -> Result<Server> {
        let host = local_ip(&cfg.interface)?;
        let socket = bind_udp(&host, cfg.port)?;
        socket.set_read_timeout(Some(SERVER_RECV_TIMEOUT))?;
        let addr = socket.local_addr()?;

        let mut all = Vec::with_capacity(devices.len() + 1);
        all.push(sysdev::build(&cfg, &host));
        all.extend(devices);
        for (i, dev) in all.iter().enumerate() {
            if all[..i].iter().any(|d| d.name() == dev.name()) {
                return Err(Error::Name(format!("duplicate device name {}", dev.name())));
            }
        }

        if cfg.debug > 0 {
            sysdev::apply_debug_level(cfg.debug);
        }

        let shared = Arc::new(ServerShared {
            host: host.clone(),
            socket,
            devices: all,
            acks: ack::AckTracker::new(),
            perf: Perf::new(),
            exit: ExitEvent::new(),
            send_lock: Mutex::new(()),
            publish_lock: Mutex::new(()),
            clients_dirty: AtomicBool::new(false),
            last_pid: Mutex::new("?".to_string()),
            cfg,
        });
        for dev in &shared.devices {
            dev.attach_server(&shared);
        }
        log::info!(
            "Server for {host}:{} is serving devices: {:?}",
            addr.port(),
            shared.devices.iter().map(|d| d.name()).collect::<Vec<_>>()
        );
        Ok(Server { shared, addr })
    }

    /// The bound socket address (the port matters when 0 was requested).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.shared.host
    }

    /// Handle for cooperative shutdown; `run` returns soon after a trigger.
    #[must_use]
    pub fn exit_event(&self) -> ExitEvent {
        self.shared.exit.clone()
    }

    /// Look up a hosted device by name (including `"server"`).
    #[must_use]
    pub fn device(&self, name: &str) -> Option<Arc<Device>> {
        self.shared.device(name)
    }

    /// Number of deliveries currently awaiting acknowledgment.
    #[must_use]
    pub fn outstanding_deliveries(&self) -> usize {
        self.shared.acks.len()
    }

    /// Serve requests until the exit event fires. Spawns the heartbeat,
    /// polling and ack-service threads; all of them observe the exit event.
    pub fn run(&self) {
        let mut handles = Vec::new();
        for (name, body) in [
            ("heartbeat", run_heartbeat as fn(&Arc<ServerShared>)),
            ("devs-poll", run_polling as fn(&Arc<ServerShared>)),
            ("ack-service", run_ack_service as fn(&Arc<ServerShared>)),
        ] {
            let shared = Arc::clone(&self.shared);
            match std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || body(&shared))
            {
                Ok(handle) => handles.push(handle),
                Err(e) => log::error!("could not spawn {name} thread: {e}"),
            }
        }

        log::info!(
            "{}. Waiting for UDP messages at {};{}",
            crate::VERSION,
            self.shared.host,
            self.addr.port()
        );
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        while !self.shared.exit.is_set() {
            match self.shared.socket.recv_from(&mut buf) {
                Ok((0, _)) => {}
                Ok((n, peer)) => broker::handle_datagram(&self.shared, &buf[..n], peer),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    log::warn!("recv error: {e}");
                }
            }
        }

        for handle in handles {
            let _ = handle.join();
        }
        log::info!("server loop stopped");
    }
}

fn run_heartbeat(shared: &Arc<ServerShared>) {
    sysdev::run_heartbeat(shared);
}

fn run_polling(shared: &Arc<ServerShared>) {
    sysdev::run_polling(shared);
}

fn run_ack_service(shared: &Arc<ServerShared>) {
    ack::run_ack_service(shared);
}

/// Bind a UDP socket with `SO_REUSEADDR`, converted into a std socket.
fn bind_udp(host: &str, port: u16) -> Result<UdpSocket> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Name(format!("invalid bind address {host}:{port}: {e}")))?;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Io)?;
    socket.set_reuse_address(true).map_err(Error::Io)?;
    socket.bind(&addr.into()).map_err(Error::Io)?;
    log::debug!("starting UDP on {addr}");
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn test_server_new_binds_ephemeral_loopback() {
        let server =
            Server::new(ServerConfig::loopback(), Vec::new()).expect("server should bind");
        assert_eq!(server.local_addr().ip().to_string(), "127.0.0.1");
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.device("server").is_some());
        assert!(server.device("nosuch").is_none());
    }

    #[test]
    fn test_duplicate_device_names_rejected() {
        let d1 = Device::builder("dev1").build();
        let d2 = Device::builder("dev1").build();
        assert!(matches!(
            Server::new(ServerConfig::loopback(), vec![d1, d2]),
            Err(Error::Name(_))
        ));
    }

    #[test]
    fn test_perf_snapshot_accumulates() {
        let perf = Perf::new();
        perf.record_send(2_000_000, Duration::from_millis(100));
        perf.record_send(1_000_000, Duration::from_millis(50));
        let snap = perf.snapshot();
        assert_eq!(snap.sends, 2);
        assert!((snap.mbytes - 3.0).abs() < 1e-9);
        assert!((snap.seconds - 0.15).abs() < 1e-6);
    }
}
