// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Small shared helpers: wall-clock seconds, cooperative exit event,
//! log-line cropping, local interface address lookup.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall clock as fractional seconds since the Unix epoch.
///
/// This is the timestamp format carried on the wire and stored in every LDO.
#[must_use]
pub fn now_ts() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(_) => 0.0,
    }
}

/// Crop long diagnostic text for log lines.
///
/// Replies can be multi-megabyte; logs never should be.
#[must_use]
pub fn crop(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = text[..end].to_string();
    out.push_str("...");
    out
}

/// Cooperative shutdown event shared by every server/client thread.
///
/// Atomic flag for the cheap check in hot loops, condvar so sleeping threads
/// (heartbeat, polling, ack service) observe the trigger without waiting out
/// their full period.
#[derive(Clone)]
pub struct ExitEvent {
    inner: Arc<ExitInner>,
}

struct ExitInner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl ExitEvent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExitInner {
                triggered: AtomicBool::new(false),
                lock: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Set the flag and wake every waiter. Idempotent.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.condvar.notify_all();
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Sleep up to `timeout`, returning early (true) if the event fires.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let mut guard = self.inner.lock.lock();
        if self.is_set() {
            return true;
        }
        let _ = self.inner.condvar.wait_for(&mut guard, timeout);
        self.is_set()
    }
}

impl Default for ExitEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the local IP address to announce for this host.
///
/// An empty interface name means "the primary interface"; `lo`/`localhost`
/// pin to the loopback address for single-machine setups.
pub fn local_ip(interface: &str) -> std::io::Result<String> {
    match interface {
        "" => match local_ip_address::local_ip() {
            Ok(ip) => Ok(ip.to_string()),
            Err(e) => Err(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no primary interface address: {e}"),
            )),
        },
        "lo" | "localhost" => Ok("127.0.0.1".to_string()),
        name => {
            let ifaces = local_ip_address::list_afinet_netifas().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot list interfaces: {e}"),
                )
            })?;
            ifaces
                .into_iter()
                .find(|(ifname, ip)| ifname == name && ip.is_ipv4())
                .map(|(_, ip)| ip.to_string())
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        format!("no IPv4 address on interface {name}"),
                    )
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_now_ts_monotonic_enough() {
        let a = now_ts();
        let b = now_ts();
        assert!(b >= a);
        assert!(a > 1.0e9, "epoch seconds expected, got {a}");
    }

    #[test]
    fn test_crop_short_text_untouched() {
        assert_eq!(crop("hello", 300), "hello");
    }

    #[test]
    fn test_crop_long_text() {
        let long = "x".repeat(400);
        let cropped = crop(&long, 300);
        assert_eq!(cropped.len(), 303);
        assert!(cropped.ends_with("..."));
    }

    #[test]
    fn test_exit_event_wakes_waiter() {
        let event = ExitEvent::new();
        let waiter = event.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let fired = waiter.wait_timeout(Duration::from_secs(5));
            (fired, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        event.trigger();
        let (fired, elapsed) = handle.join().expect("waiter thread should finish");
        assert!(fired);
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_exit_event_timeout_without_trigger() {
        let event = ExitEvent::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        assert!(!event.is_set());
    }
}
