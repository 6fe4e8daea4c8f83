// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The built-in `server` device and its background threads.
//!
//! Exactly one per server. Besides the required `run`/`status` pair it
//! carries identity (`version`, `host`), tuning (`debug`,
//! `devsPollingInterval`), the `Reset` fan-out action, and the
//! heartbeat-maintained observables (`perf`, `statistics`, `clientsInfo`,
//! `lastPID`).

use crate::config::ServerConfig;
use crate::device::Device;
use crate::ldo::{Ldo, LdoValue};
use crate::server::ServerShared;
use crate::util::{crop, now_ts};
use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Map the `debug` LDO (0-10) onto the global log filter.
pub(crate) fn apply_debug_level(level: i64) {
    let filter = match level {
        l if l <= 0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    log::set_max_level(filter);
    log::info!("Debugging level set to {level}");
}

/// Build the unique `server` device.
pub(crate) fn build(cfg: &ServerConfig, host: &str) -> Arc<Device> {
    Device::builder("server")
        .param(
            "status",
            Ldo::new("R", "Messages from the server", LdoValue::text("")),
        )
        .param(
            "version",
            Ldo::new("", "litebus server", LdoValue::text(crate::VERSION)),
        )
        .param("host", Ldo::new("", "Host name", LdoValue::text(host)))
        .param(
            "debug",
            Ldo::new("RWE", "Logging verbosity", LdoValue::ints([cfg.debug]))
                .with_op_limits(Some(0.0), Some(10.0)),
        )
        .set_hook(
            "debug",
            |_dev: &Device, _name: &str, _old: &LdoValue, new: &LdoValue| {
                if let LdoValue::Ints(v) = new {
                    apply_debug_level(v.first().copied().unwrap_or(0));
                }
                Ok(())
            },
        )
        .param(
            "devsPollingInterval",
            Ldo::new(
                "RWE",
                "Time interval of calling poll() method for all devices",
                LdoValue::floats([cfg.polling_interval]),
            )
            .with_units("s"),
        )
        .param(
            "Reset",
            Ldo::new("WE", "Reset all devices on the server", LdoValue::Null),
        )
        .set_hook(
            "Reset",
            |dev: &Device, _name: &str, _old: &LdoValue, _new: &LdoValue| {
                fan_out_reset(dev);
                Ok(())
            },
        )
        .param(
            "lastPID",
            Ldo::new("", "Source of the last request", LdoValue::text("?")),
        )
        .param(
            "perf",
            Ldo::new(
                "R",
                "Performance: sends,MBytes,MBytes/s,retransmits,itemsLost,dropped",
                LdoValue::floats([0.0; 6]),
            ),
        )
        .param(
            "statistics",
            Ldo::new(
                "R",
                "Number of items and subscriptions in circulation",
                LdoValue::ints([0, 0]),
            ),
        )
        .param(
            "clientsInfo",
            Ldo::new("R", "Info on all subscriptions", LdoValue::text("")),
        )
        .read_hook("clientsInfo", |dev: &Device, name: &str| {
            let Some(shared) = dev.shared() else {
                return Ok(());
            };
            let ts = now_ts();
            dev.set_value_ts(name, LdoValue::text(clients_info_text(&shared, ts)), ts)
        })
        .build_server()
}

/// Run every non-server device's reset on a short-lived background thread,
/// so the broker returns promptly.
fn fan_out_reset(server_dev: &Device) {
    let Some(shared) = server_dev.shared() else {
        return;
    };
    for dev in shared.devices.iter().filter(|d| d.name() != "server") {
        let dev = Arc::clone(dev);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-reset", dev.name()))
            .spawn(move || {
                dev.logic().reset(&dev);
            });
        if let Err(e) = spawned {
            log::warn!("could not spawn reset thread: {e}");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Textual subscriber inventory: device, client, seconds since last
/// delivery, and the subscribed request.
pub(crate) fn clients_info_text(shared: &ServerShared, current_time: f64) -> String {
    let mut out = String::new();
    for dev in &shared.devices {
        for entry in dev.subscribers().iter() {
            let sub = entry.value();
            let dt = current_time - sub.last_delivered;
            let request: Vec<String> = sub
                .request
                .iter()
                .map(|t| format!("{}:{:?}", t.cns_dev, t.pars))
                .collect();
            let _ = writeln!(
                out,
                "{} {} {:.3}s {}",
                dev.name(),
                entry.key(),
                dt,
                crop(&request.join(","), 200)
            );
        }
    }
    out
}

/// Heartbeat thread: refresh `statistics`, `perf` and (when the inventory
/// changed) `clientsInfo`, then publish the server device.
pub(crate) fn run_heartbeat(shared: &Arc<ServerShared>) {
    log::info!("Heartbeat thread started");
    let mut prev_mbytes = 0.0f64;
    let mut prev_seconds = 0.0f64;
    loop {
        if shared.exit.wait_timeout(shared.cfg.heartbeat_period) {
            break;
        }
        let Some(sysdev) = shared.device("server") else {
            break;
        };
        let ts = now_ts();

        let mut items = 0usize;
        let mut sockets = 0usize;
        for dev in &shared.devices {
            let (ns, ni) = dev.subscriber_stats();
            sockets += ns;
            items += ni;
        }
        let _ = sysdev.set_value_ts(
            "statistics",
            LdoValue::ints([items as i64, sockets as i64]),
            ts,
        );

        let snap = shared.perf.snapshot();
        let dt = snap.seconds - prev_seconds;
        let mbps = if dt > 0.0 {
            ((snap.mbytes - prev_mbytes) / dt * 10.0).round() / 10.0
        } else {
            0.0
        };
        let _ = sysdev.set_value_ts(
            "perf",
            LdoValue::floats([
                snap.sends as f64,
                (snap.mbytes * 1000.0).round() / 1000.0,
                mbps,
                snap.retransmits as f64,
                snap.items_lost as f64,
                snap.dropped as f64,
            ]),
            ts,
        );
        prev_mbytes = snap.mbytes;
        prev_seconds = snap.seconds;

        if shared.clients_dirty.swap(false, Ordering::AcqRel) {
            let text = clients_info_text(shared, ts);
            let _ = sysdev.set_value_ts("clientsInfo", LdoValue::text(text), ts);
        }

        sysdev.publish();
    }
    log::info!("Heartbeat stopped");
}

/// Polling thread: call `poll()` on every non-server device each
/// `devsPollingInterval` seconds (a live LDO value).
pub(crate) fn run_polling(shared: &Arc<ServerShared>) {
    // Give devices time to settle after startup.
    if shared.exit.wait_timeout(Duration::from_millis(500)) {
        return;
    }
    log::debug!("Device polling started");
    let mut interval = 0.0f64;
    loop {
        let new_interval = shared
            .device("server")
            .and_then(|d| d.value("devsPollingInterval"))
            .and_then(|v| match v {
                LdoValue::Floats(x) => x.first().copied(),
                LdoValue::Ints(x) => x.first().map(|&i| i as f64),
                _ => None,
            })
            .unwrap_or(1.0);
        if (new_interval - interval).abs() > f64::EPSILON {
            log::info!("Polling interval changed from {interval} to {new_interval}");
            interval = new_interval;
        }
        if shared
            .exit
            .wait_timeout(Duration::from_secs_f64(interval.max(0.01)))
        {
            break;
        }
        for dev in shared.devices.iter().filter(|d| d.name() != "server") {
            dev.logic().poll(dev);
        }
    }
    log::debug!("Device polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn test_server_device_parameter_set() {
        let dev = build(&ServerConfig::default(), "testhost");
        let names = dev.param_names();
        for expected in [
            "run",
            "status",
            "version",
            "host",
            "debug",
            "devsPollingInterval",
            "Reset",
            "lastPID",
            "perf",
            "statistics",
            "clientsInfo",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
        assert_eq!(dev.value("host"), Some(LdoValue::text("testhost")));
        assert_eq!(dev.value("version"), Some(LdoValue::text(crate::VERSION)));
    }

    #[test]
    fn test_server_run_accepts_exit_token() {
        // Exit is legal on the server device (no server attached here, so
        // the transition only runs the no-op logic).
        let dev = build(&ServerConfig::default(), "h");
        dev.set_param("run", LdoValue::text("Exit"))
            .expect("server device accepts Exit");
    }

    #[test]
    fn test_debug_out_of_limits_rejected() {
        let dev = build(&ServerConfig::default(), "h");
        assert!(dev.set_param("debug", LdoValue::ints([11])).is_err());
        assert!(dev.set_param("debug", LdoValue::ints([2])).is_ok());
    }
}
