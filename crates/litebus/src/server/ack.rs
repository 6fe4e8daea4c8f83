// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outstanding-delivery tracking and the beacon service.
//!
//! Every multi-chunk send registers its chunks here, keyed by client, until
//! the client's `b"ACK"` clears the entry. A background service decrements
//! each entry's countdown every `AckInterval` and re-announces the delivery
//! with a beacon; the publisher treats an expired countdown as a failed
//! delivery and eventually evicts the subscriber.

use crate::config::BEACON;
use crate::server::ServerShared;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Chunks of one unacknowledged delivery, keyed by `(offset, size)`.
pub(crate) type ChunkMap = HashMap<(u32, u32), Vec<u8>>;

pub(crate) struct AckEntry {
    pub countdown: i32,
    pub chunks: ChunkMap,
}

/// Process-wide map of unacknowledged deliveries.
pub(crate) struct AckTracker {
    entries: DashMap<SocketAddr, AckEntry>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a fresh delivery. Returns false (and registers nothing) if
    /// the client still has one outstanding; that client is presumed dead.
    pub fn register(&self, client: SocketAddr, chunks: ChunkMap, countdown: i32) -> bool {
        if self.entries.contains_key(&client) {
            log::info!("Client {client} presumed dead");
            return false;
        }
        self.entries.insert(client, AckEntry { countdown, chunks });
        true
    }

    /// Clear on `b"ACK"`. Returns whether an entry existed.
    pub fn clear(&self, client: &SocketAddr) -> bool {
        self.entries.remove(client).is_some()
    }

    pub fn remove(&self, client: &SocketAddr) {
        self.entries.remove(client);
    }

    pub fn is_outstanding(&self, client: &SocketAddr) -> bool {
        self.entries.contains_key(client)
    }

    pub fn countdown(&self, client: &SocketAddr) -> Option<i32> {
        self.entries.get(client).map(|e| e.countdown)
    }

    /// Re-arm the countdown after the publisher books a lost delivery.
    pub fn reset_countdown(&self, client: &SocketAddr, countdown: i32) {
        if let Some(mut entry) = self.entries.get_mut(client) {
            entry.countdown = countdown;
        }
    }

    /// Stored datagram for a retransmit request, prefix included.
    pub fn chunk(&self, client: &SocketAddr, offset: u32, size: u32) -> Option<Vec<u8>> {
        self.entries
            .get(client)
            .and_then(|e| e.chunks.get(&(offset, size)).cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// One service pass: decrement countdowns, re-announce with beacons,
    /// drop entries that fell far past the limit.
    fn service_pass(&self, shared: &ServerShared) {
        let clients: Vec<SocketAddr> = self.entries.iter().map(|e| *e.key()).collect();
        for client in clients {
            let countdown = {
                let Some(mut entry) = self.entries.get_mut(&client) else {
                    continue;
                };
                entry.countdown -= 1;
                entry.countdown
            };
            if countdown <= 2 {
                log::warn!("waiting for ACK{countdown} from {client}");
            }
            if countdown < -10 {
                log::warn!("abnormal unsubscribing of {client}");
                self.entries.remove(&client);
                continue;
            }
            if let Err(e) = shared.socket.send_to(&BEACON, client) {
                log::debug!("beacon to {client} failed: {e}");
            }
        }
    }
}

/// The ack service loop; one dedicated thread per server.
pub(crate) fn run_ack_service(shared: &ServerShared) {
    log::debug!("ack service started");
    loop {
        if shared.exit.wait_timeout(shared.cfg.ack_interval) {
            break;
        }
        shared.acks.service_pass(shared);
    }
    log::debug!("ack service stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().expect("socket addr")
    }

    fn one_chunk() -> ChunkMap {
        let mut chunks = ChunkMap::new();
        chunks.insert((0, 4), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        chunks
    }

    #[test]
    fn test_register_and_clear() {
        let tracker = AckTracker::new();
        let c = client(5001);
        assert!(tracker.register(c, one_chunk(), 10));
        assert!(tracker.is_outstanding(&c));
        assert_eq!(tracker.countdown(&c), Some(10));
        assert!(tracker.clear(&c));
        assert!(!tracker.is_outstanding(&c));
        assert!(!tracker.clear(&c));
    }

    #[test]
    fn test_double_register_refused() {
        let tracker = AckTracker::new();
        let c = client(5002);
        assert!(tracker.register(c, one_chunk(), 10));
        assert!(!tracker.register(c, one_chunk(), 10));
    }

    #[test]
    fn test_chunk_lookup_exact_key() {
        let tracker = AckTracker::new();
        let c = client(5003);
        tracker.register(c, one_chunk(), 10);
        let datagram = tracker.chunk(&c, 0, 4).expect("stored chunk");
        assert_eq!(datagram.len(), 8);
        assert!(tracker.chunk(&c, 0, 5).is_none());
        assert!(tracker.chunk(&client(5999), 0, 4).is_none());
    }

    #[test]
    fn test_reset_countdown() {
        let tracker = AckTracker::new();
        let c = client(5004);
        tracker.register(c, one_chunk(), 0);
        tracker.reset_countdown(&c, 10);
        assert_eq!(tracker.countdown(&c), Some(10));
    }
}
