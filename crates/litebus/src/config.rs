// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol constants and runtime server configuration.
//!
//! Every wire-level constant lives here, nowhere else.

use std::time::Duration;

/// Default UDP port a litebus server listens on.
pub const DEFAULT_PORT: u16 = 9700;

/// Delimiter between host, device and parameter in wire names
/// (`host:device:parameter`).
pub const NS_DELIMITER: char = ':';

/// Delimiter inside a name-service resolution string (`host;port;device`).
pub const CNS_DELIMITER: char = ';';

/// Maximum chunk payload per UDP datagram. The 4-byte offset prefix rides on
/// top of this, keeping datagrams under the 65535-byte UDP ceiling.
pub const CHUNK_SIZE: usize = 65000;

/// Byte length of the big-endian offset prefix on every data datagram.
pub const PREFIX_LEN: usize = 4;

/// The beacon / end-of-data datagram: an offset-0 prefix with no payload.
pub const BEACON: [u8; PREFIX_LEN] = [0; PREFIX_LEN];

/// The client's delivery acknowledgment payload.
pub const ACK: &[u8] = b"ACK";

/// Number of ack rounds granted before a client counts as unresponsive.
pub const MAX_ACK_COUNT: i32 = 10;

/// Period of the ack service (beacon re-announce + countdown).
pub const ACK_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive failed deliveries before a subscriber is evicted.
pub const ITEM_LOST_LIMIT: u32 = 1;

/// Optional pause between chunks of one multi-chunk reply. Zero by default;
/// raise on networks that drop back-to-back datagrams.
pub const CHUNK_SLEEP: Duration = Duration::ZERO;

/// Maximum retransmit rounds a receiver attempts before giving up.
pub const MAX_RETRANSMIT_TRIES: u32 = 5;

/// Pre-data beacons a receiver tolerates (echoes of past transfers).
pub const IGNORE_EOD_COUNT: u32 = 3;

/// A reassembly gap wider than this is unrecoverable; the transfer fails.
pub const MAX_GAP_BYTES: u32 = 65536;

/// Receive buffer for a single datagram (prefix + max chunk).
pub const RECV_BUF_SIZE: usize = 65536;

/// Server-side socket read timeout; bounds how long exit takes to observe.
pub const SERVER_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Default client transaction timeout.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat period for server statistics/perf publication.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

/// Replies below this size do not count toward perf throughput statistics.
pub const PERF_MIN_BYTES: usize = 1000;

/// Reply prefix marking a server-side error; clients raise on it.
pub const ERR_PREFIX: &str = "ERR.LS";

/// Reply prefix marking a non-fatal server-side warning.
pub const WARN_PREFIX: &str = "WARNING";

/// Runtime knobs of one [`crate::server::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind (`""` = primary, `"lo"` = loopback).
    pub interface: String,
    /// UDP port; 0 asks the OS for an ephemeral port (tests).
    pub port: u16,
    /// Chunk payload cap for outbound replies.
    pub chunk_size: usize,
    /// Pause between chunks of a multi-chunk reply.
    pub chunk_sleep: Duration,
    /// Ack rounds granted per delivery.
    pub max_ack_count: i32,
    /// Ack service period.
    pub ack_interval: Duration,
    /// Consecutive losses before subscriber eviction.
    pub item_lost_limit: u32,
    /// Heartbeat period.
    pub heartbeat_period: Duration,
    /// Initial `devsPollingInterval` in seconds (live-tunable via LDO).
    pub polling_interval: f64,
    /// Initial debug level (0-10), mirrored into the `debug` LDO.
    pub debug: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            port: DEFAULT_PORT,
            chunk_size: CHUNK_SIZE,
            chunk_sleep: CHUNK_SLEEP,
            max_ack_count: MAX_ACK_COUNT,
            ack_interval: ACK_INTERVAL,
            item_lost_limit: ITEM_LOST_LIMIT,
            heartbeat_period: HEARTBEAT_PERIOD,
            polling_interval: 1.0,
            debug: 0,
        }
    }
}

impl ServerConfig {
    /// Loopback config on an ephemeral port, as used by the test suites.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            interface: "lo".to_string(),
            port: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_plus_prefix_fits_a_datagram() {
        assert!(CHUNK_SIZE + PREFIX_LEN <= 65535);
        assert!(CHUNK_SIZE + PREFIX_LEN <= RECV_BUF_SIZE);
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.max_ack_count, MAX_ACK_COUNT);
        assert_eq!(cfg.item_lost_limit, ITEM_LOST_LIMIT);
    }
}
