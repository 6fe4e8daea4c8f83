// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end access scenarios against a loopback server.

use litebus::{
    Access, Device, Dtype, Error, Ldo, LdoValue, NdArray, Resolver, Server, ServerConfig,
};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A running loopback server plus everything a test needs to talk to it.
struct Fixture {
    host: String,
    dev1: Arc<Device>,
    exit: litebus::ExitEvent,
    thread: JoinHandle<()>,
}

impl Fixture {
    fn start() -> Self {
        let image = NdArray::new(vec![40, 60, 3], Dtype::U8, test_image(40 * 60 * 3))
            .expect("image array");
        let dev1 = Device::builder("dev1")
            .param(
                "frequency",
                Ldo::new("RWE", "Cycle frequency", LdoValue::floats([1.0]))
                    .with_units("Hz")
                    .with_op_limits(Some(0.0), Some(10.0)),
            )
            .param("counters", Ldo::new("R", "Event counters", LdoValue::ints([0])))
            .param("image", Ldo::new("R", "Camera frame", LdoValue::Array(image)))
            .build();

        // A small chunk size forces the image reply through many chunks.
        let cfg = ServerConfig {
            chunk_size: 6000,
            ..ServerConfig::loopback()
        };
        let server = Server::new(cfg, vec![dev1.clone()]).expect("server should start");
        let host = format!("127.0.0.1;{}", server.local_addr().port());
        let exit = server.exit_event();
        let thread = std::thread::spawn(move || server.run());
        Self {
            host,
            dev1,
            exit,
            thread,
        }
    }

    fn access(&self) -> Access {
        Access::new(Resolver::direct()).with_timeout(Duration::from_secs(5))
    }

    fn dev(&self, device: &str) -> String {
        format!("{}:{device}", self.host)
    }

    fn stop(self) {
        self.exit.trigger();
        let _ = self.thread.join();
    }
}

fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

#[test]
fn test_info_wildcard_on_server_device() {
    let fx = Fixture::start();
    let access = fx.access();

    let reply = access
        .info(&[(&fx.dev("server"), "*")])
        .expect("info should succeed");
    for par in [
        "version",
        "host",
        "status",
        "debug",
        "devsPollingInterval",
        "perf",
        "statistics",
        "clientsInfo",
        "lastPID",
    ] {
        let key = format!("{}:{par}", fx.dev("server"));
        let reading = reply
            .get(&key)
            .unwrap_or_else(|| panic!("missing {key} in {:?}", reply.keys()));
        assert!(
            reading.props.iter().any(|(k, _)| k == "desc"),
            "{par} should carry a desc"
        );
    }
    fx.stop();
}

#[test]
fn test_get_scalar_value_and_timestamp() {
    let fx = Fixture::start();
    let access = fx.access();
    let t0 = fx.dev1.timestamp("frequency").expect("timestamp");

    let reply = access
        .get(&[(&fx.dev("dev1"), "frequency")])
        .expect("get should succeed");
    let reading = reply.find("dev1:frequency").expect("frequency reading");
    assert_eq!(reading.value, LdoValue::floats([1.0]));
    assert_eq!(reading.timestamp, Some(t0));
    fx.stop();
}

#[test]
fn test_set_then_get_roundtrip() {
    let fx = Fixture::start();
    let access = fx.access();

    access
        .set(&fx.dev("dev1"), "frequency", LdoValue::floats([2.5]))
        .expect("set should succeed");
    let reply = access
        .get(&[(&fx.dev("dev1"), "frequency")])
        .expect("get should succeed");
    assert_eq!(
        reply.find("dev1:frequency").expect("reading").value,
        LdoValue::floats([2.5])
    );
    fx.stop();
}

#[test]
fn test_set_out_of_limits_rejected_and_value_unchanged() {
    let fx = Fixture::start();
    let access = fx.access();

    let result = access.set(&fx.dev("dev1"), "frequency", LdoValue::floats([20.0]));
    match result {
        Err(Error::Remote(msg)) => assert!(msg.starts_with("ERR.LS"), "got: {msg}"),
        other => panic!("expected a remote error, got {other:?}"),
    }

    let reply = access
        .get(&[(&fx.dev("dev1"), "frequency")])
        .expect("get should succeed");
    assert_eq!(
        reply.find("dev1:frequency").expect("reading").value,
        LdoValue::floats([1.0])
    );
    fx.stop();
}

#[test]
fn test_set_coerces_int_to_float_parameter() {
    let fx = Fixture::start();
    let access = fx.access();

    access
        .set(&fx.dev("dev1"), "frequency", LdoValue::ints([3]))
        .expect("coercing set should succeed");
    assert_eq!(
        fx.dev1.value("frequency"),
        Some(LdoValue::floats([3.0]))
    );
    fx.stop();
}

#[test]
fn test_set_on_readonly_parameter_rejected() {
    let fx = Fixture::start();
    let access = fx.access();

    let result = access.set(&fx.dev("dev1"), "counters", LdoValue::ints([5]));
    assert!(matches!(result, Err(Error::Remote(_))));
    fx.stop();
}

#[test]
fn test_large_array_delivery_reconstructs_exactly() {
    let fx = Fixture::start();
    let access = fx.access();

    let reply = access
        .get(&[(&fx.dev("dev1"), "image")])
        .expect("get should succeed");
    let reading = reply.find("dev1:image").expect("image reading");
    match &reading.value {
        LdoValue::Array(a) => {
            assert_eq!(a.shape, vec![40, 60, 3]);
            assert_eq!(a.dtype, Dtype::U8);
            assert_eq!(a.data, test_image(40 * 60 * 3));
        }
        other => panic!("expected array, got {other:?}"),
    }
    fx.stop();
}

#[test]
fn test_unknown_device_is_a_remote_error() {
    let fx = Fixture::start();
    let access = fx.access();

    let result = access.get(&[(&fx.dev("nodev"), "x")]);
    match result {
        Err(Error::Remote(msg)) => assert!(msg.contains("not served"), "got: {msg}"),
        other => panic!("expected a remote error, got {other:?}"),
    }
    fx.stop();
}

#[test]
fn test_unknown_parameter_is_skipped_quietly() {
    let fx = Fixture::start();
    let access = fx.access();

    // Unknown parameters are dropped from the reply; known ones survive.
    let reply = access
        .get(&[
            (&fx.dev("dev1"), "frequency"),
            (&fx.dev("dev1"), "bogus"),
        ])
        .expect("get should succeed");
    assert_eq!(reply.len(), 1);
    assert!(reply.find("dev1:frequency").is_some());
    fx.stop();
}

#[test]
fn test_list_devices() {
    let fx = Fixture::start();
    let access = fx.access();

    let devices = access.list_devices(&fx.host).expect("device list");
    assert_eq!(devices, ["server", "dev1"]);
    fx.stop();
}

#[test]
fn test_wildcard_device_reaches_every_device() {
    let fx = Fixture::start();
    let access = fx.access();

    let reply = access
        .get(&[(&format!("{}:*", fx.host), "run")])
        .expect("get should succeed");
    let keys = reply.keys();
    assert!(keys.iter().any(|k| k.ends_with("server:run")), "{keys:?}");
    assert!(keys.iter().any(|k| k.ends_with("dev1:run")), "{keys:?}");
    fx.stop();
}

#[test]
fn test_info_carries_units_and_limits() {
    let fx = Fixture::start();
    let access = fx.access();

    let reply = access
        .info(&[(&fx.dev("dev1"), "frequency")])
        .expect("info should succeed");
    let reading = reply.find("dev1:frequency").expect("reading");
    assert!(reading
        .props
        .iter()
        .any(|(k, v)| k == "units" && v.as_str() == Some("Hz")));
    assert!(reading.props.iter().any(|(k, _)| k == "opLimits"));
    fx.stop();
}

#[test]
fn test_last_pid_reports_previous_requester() {
    let fx = Fixture::start();
    let access = fx.access();

    // First request primes the bookkeeping, second reads the previous one.
    access
        .get(&[(&fx.dev("dev1"), "frequency")])
        .expect("first get");
    let reply = access
        .get(&[(&fx.dev("server"), "lastPID")])
        .expect("second get");
    let reading = reply.find("server:lastPID").expect("lastPID reading");
    match reading.value.first_str() {
        Some(s) => assert!(s.contains("127.0.0.1"), "got: {s}"),
        None => panic!("lastPID should be a string"),
    }
    fx.stop();
}

#[test]
fn test_stopping_run_parameter_transitions_state() {
    let fx = Fixture::start();
    let access = fx.access();

    let reply = access
        .set(&fx.dev("dev1"), "run", LdoValue::text("Stop"))
        .expect("stop should succeed");
    assert_eq!(
        reply.find("dev1:run").expect("run reading").value,
        LdoValue::text("Stopped")
    );

    let result = access.set(&fx.dev("dev1"), "run", LdoValue::text("Nonsense"));
    assert!(matches!(result, Err(Error::Remote(_))));
    fx.stop();
}
