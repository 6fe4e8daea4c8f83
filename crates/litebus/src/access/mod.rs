// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client access surface.
//!
//! [`Access`] offers `info`/`get`/`read`/`set`/`subscribe`/`unsubscribe_all`
//! over `(name:device, parameter)` targets. Targets group by their resolved
//! `(host, port)`; each host gets one cached UDP socket and its transactions
//! run sequentially. Subscriptions get a dedicated socket per host with a
//! receive thread and a single callback.

pub(crate) mod sub;
pub(crate) mod xact;

use crate::cns::{HostPort, Resolver};
use crate::codec::Value;
use crate::config::{CLIENT_TIMEOUT, NS_DELIMITER};
use crate::error::{Error, Result};
use crate::ldo::LdoValue;
use crate::proto::{Command, Request, Target};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

/// One parameter's decoded reply entry.
#[derive(Debug, Clone)]
pub struct Reading {
    pub value: LdoValue,
    pub timestamp: Option<f64>,
    /// Remaining metadata properties (from `info`).
    pub props: Vec<(String, Value)>,
}

/// A decoded reply map, keys as the server sent them
/// (`"host:device:parameter"`).
#[derive(Debug, Clone, Default)]
pub struct Reply(Vec<(String, Reading)>);

impl Reply {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Exact-key lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Reading> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, r)| r)
    }

    /// Suffix lookup by `"device:parameter"` or bare parameter name.
    #[must_use]
    pub fn find(&self, dev_par: &str) -> Option<&Reading> {
        let suffix = format!("{NS_DELIMITER}{dev_par}");
        self.0
            .iter()
            .find(|(k, _)| k == dev_par || k.ends_with(&suffix))
            .map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Reading)> {
        self.0.iter()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(k, _)| k.as_str()).collect()
    }

    fn extend(&mut self, other: Reply) {
        self.0.extend(other.0);
    }
}

/// Decode a reply map, applying the numpy convention: a `numpy` key turns
/// the sibling bytes into a shaped array and disappears from the result.
pub fn decode_reply(value: &Value) -> Result<Reply> {
    let Some(pairs) = value.as_object() else {
        // Error strings were already intercepted; anything else decodes empty.
        return Ok(Reply::default());
    };
    let mut readings = Vec::with_capacity(pairs.len());
    for (key, entry) in pairs {
        let Some(entry_pairs) = entry.as_object() else {
            log::warn!("non-map reply entry for {key}");
            continue;
        };
        let raw_value = entry.get("value");
        let numpy = entry.get("numpy");
        let ldo_value = match raw_value {
            Some(v) => LdoValue::from_wire(v, numpy)?,
            None => LdoValue::Null,
        };
        let timestamp = entry.get("timestamp").and_then(Value::as_f64);
        let props: Vec<(String, Value)> = entry_pairs
            .iter()
            .filter(|(k, _)| k != "value" && k != "numpy" && k != "timestamp")
            .cloned()
            .collect();
        readings.push((
            key.clone(),
            Reading {
                value: ldo_value,
                timestamp,
                props,
            },
        ));
    }
    Ok(Reply(readings))
}

/// Requester identity stamped onto every request.
#[derive(Debug, Clone)]
struct Identity {
    username: String,
    program: String,
    pid: i64,
}

impl Identity {
    fn capture() -> Self {
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "?".to_string());
        let program = std::env::args().next().unwrap_or_else(|| "?".to_string());
        Self {
            username,
            program,
            pid: i64::from(std::process::id()),
        }
    }
}

/// Universal access to litebus parameters.
pub struct Access {
    resolver: Resolver,
    timeout: Duration,
    sockets: DashMap<(String, u16), Arc<UdpSocket>>,
    subscriptions: Mutex<HashMap<(String, u16), sub::SubscriptionSocket>>,
    identity: Identity,
}

impl Access {
    #[must_use]
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            timeout: CLIENT_TIMEOUT,
            sockets: DashMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
            identity: Identity::capture(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Metadata of the named parameters (`"*"` for all of a device).
    pub fn info(&self, targets: &[(&str, &str)]) -> Result<Reply> {
        self.command(Command::Info, targets)
    }

    /// Current value and timestamp, refreshing lazily polled parameters.
    pub fn get(&self, targets: &[(&str, &str)]) -> Result<Reply> {
        self.command(Command::Get, targets)
    }

    /// Readable parameters whose timestamp advanced since the device's last
    /// publish.
    pub fn read(&self, targets: &[(&str, &str)]) -> Result<Reply> {
        self.command(Command::Read, targets)
    }

    /// Set one parameter of one device.
    pub fn set(&self, device: &str, par: &str, value: LdoValue) -> Result<Reply> {
        let (host_port, mut targets) = self
            .group(&[(device, par)])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Name(format!("cannot resolve {device}")))?;
        let target = &mut targets[0];
        target.props = vec!["value".to_string()];
        target.vals = Some(value.to_wire_pairs().swap_remove(0).1);
        self.transaction(&host_port, Command::Set, targets)
    }

    /// List the devices served by a host (a bare `info` command).
    pub fn list_devices(&self, name: &str) -> Result<Vec<String>> {
        let host_port = self.resolver.resolve(name)?;
        let addr = host_port.to_socket_addr()?;
        let socket = self.socket_for(&host_port)?;
        let mut request = Request::new(Command::Info, Vec::new());
        self.stamp(&mut request);
        let value = xact::transact(&socket, addr, &request)?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Subscribe to asynchronous updates. One callback per remote host: the
    /// first subscription to a host registers it, later ones reuse it.
    pub fn subscribe(
        &self,
        targets: &[(&str, &str)],
        callback: impl Fn(Reply) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut groups = self.group(targets)?;
        if groups.len() != 1 {
            return Err(Error::Protocol(
                "subscription is supported only for a single host;port".into(),
            ));
        }
        let (host_port, targets) = groups.swap_remove(0);
        let addr = host_port.to_socket_addr()?;
        let key = (host_port.host.clone(), host_port.port);

        let mut subs = self.subscriptions.lock();
        let entry = match subs.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => {
                log::info!(
                    "only one callback per host: reusing the one registered for {}",
                    host_port.host
                );
                e.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(sub::SubscriptionSocket::start(addr, Box::new(callback))?)
            }
        };
        let mut request = Request::new(Command::Subscribe, targets);
        self.stamp(&mut request);
        entry.send_request(&request)
    }

    /// Unsubscribe from every server and tear the receive threads down.
    pub fn unsubscribe_all(&self) {
        let mut subs = self.subscriptions.lock();
        for (_, socket) in subs.drain() {
            let mut request = Request::new(
                Command::Unsubscribe,
                vec![Target::new("*", vec!["*".to_string()])],
            );
            self.stamp(&mut request);
            socket.shutdown(&request);
        }
        log::info!("all unsubscribed");
    }

    // ===== internals =====

    fn command(&self, command: Command, targets: &[(&str, &str)]) -> Result<Reply> {
        let mut merged = Reply::default();
        for (host_port, group) in self.group(targets)? {
            let reply = self.transaction(&host_port, command, group)?;
            merged.extend(reply);
        }
        Ok(merged)
    }

    fn transaction(
        &self,
        host_port: &HostPort,
        command: Command,
        targets: Vec<Target>,
    ) -> Result<Reply> {
        let addr = host_port.to_socket_addr()?;
        let socket = self.socket_for(host_port)?;
        let mut request = Request::new(command, targets);
        self.stamp(&mut request);
        match xact::transact(&socket, addr, &request) {
            Ok(value) => decode_reply(&value),
            // Delivery failures yield an empty result, not an error.
            Err(Error::Timeout) => {
                log::warn!("empty reply from {}:{}", host_port.host, host_port.port);
                Ok(Reply::default())
            }
            Err(Error::Delivery(msg)) => {
                log::warn!(
                    "delivery from {}:{} failed: {msg}",
                    host_port.host,
                    host_port.port
                );
                Ok(Reply::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Group `(name:device, parameter)` targets by resolved host, merging
    /// parameters of the same device into one target.
    fn group(&self, targets: &[(&str, &str)]) -> Result<Vec<(HostPort, Vec<Target>)>> {
        let mut groups: Vec<(HostPort, Vec<Target>)> = Vec::new();
        for (dev_name, par) in targets {
            let (name, _device) = dev_name.rsplit_once(NS_DELIMITER).ok_or_else(|| {
                Error::Name(format!(
                    "device name {dev_name} is wrong, it should be of the form host:device"
                ))
            })?;
            let host_port = self.resolver.resolve(name)?;
            let cns_dev = dev_name.to_string();
            let index = match groups.iter().position(|(hp, _)| *hp == host_port) {
                Some(i) => i,
                None => {
                    groups.push((host_port, Vec::new()));
                    groups.len() - 1
                }
            };
            let group = &mut groups[index].1;
            match group.iter_mut().find(|t| t.cns_dev == cns_dev) {
                Some(target) => target.pars.push((*par).to_string()),
                None => group.push(Target::new(cns_dev, vec![(*par).to_string()])),
            }
        }
        Ok(groups)
    }

    fn socket_for(&self, host_port: &HostPort) -> Result<Arc<UdpSocket>> {
        let key = (host_port.host.clone(), host_port.port);
        if let Some(socket) = self.sockets.get(&key) {
            return Ok(Arc::clone(&socket));
        }
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.timeout))?;
        let socket = Arc::new(socket);
        self.sockets.insert(key, Arc::clone(&socket));
        Ok(socket)
    }

    fn stamp(&self, request: &mut Request) {
        request.username = self.identity.username.clone();
        request.program = self.identity.program.clone();
        request.pid = self.identity.pid;
    }
}

impl Drop for Access {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reply_plain_and_numpy() {
        let wire = Value::object(vec![
            (
                "h:dev1:frequency".to_string(),
                Value::object(vec![
                    (
                        "value".to_string(),
                        Value::Array(vec![Value::Float(1.0)]),
                    ),
                    ("timestamp".to_string(), Value::Float(5.0)),
                ]),
            ),
            (
                "h:dev1:image".to_string(),
                Value::object(vec![
                    ("value".to_string(), Value::Bytes(vec![1, 2, 3, 4, 5, 6])),
                    (
                        "numpy".to_string(),
                        Value::Array(vec![
                            Value::Array(vec![Value::Int(2), Value::Int(3)]),
                            Value::str("uint8"),
                        ]),
                    ),
                    ("timestamp".to_string(), Value::Float(6.0)),
                ]),
            ),
        ]);
        let reply = decode_reply(&wire).expect("decode");
        assert_eq!(reply.len(), 2);

        let freq = reply.find("dev1:frequency").expect("frequency entry");
        assert_eq!(freq.value, LdoValue::floats([1.0]));
        assert_eq!(freq.timestamp, Some(5.0));

        let image = reply.find("dev1:image").expect("image entry");
        match &image.value {
            LdoValue::Array(a) => {
                assert_eq!(a.shape, vec![2, 3]);
                assert_eq!(a.data, vec![1, 2, 3, 4, 5, 6]);
            }
            other => panic!("expected array, got {other:?}"),
        }
        // The numpy key is gone from the visible props.
        assert!(image.props.iter().all(|(k, _)| k != "numpy"));
    }

    #[test]
    fn test_decode_reply_keeps_metadata_props() {
        let wire = Value::object(vec![(
            "h:server:version".to_string(),
            Value::object(vec![
                (
                    "value".to_string(),
                    Value::Array(vec![Value::str("0.3.2")]),
                ),
                ("desc".to_string(), Value::str("litebus server")),
                ("features".to_string(), Value::str("")),
            ]),
        )]);
        let reply = decode_reply(&wire).expect("decode");
        let version = reply.find("server:version").expect("entry");
        assert!(version
            .props
            .iter()
            .any(|(k, v)| k == "desc" && v.as_str() == Some("litebus server")));
    }

    #[test]
    fn test_group_merges_parameters_per_device() {
        let access = Access::new(Resolver::direct());
        let groups = access
            .group(&[
                ("127.0.0.1;9700:dev1", "frequency"),
                ("127.0.0.1;9700:dev1", "status"),
                ("127.0.0.1;9700:dev2", "counters"),
            ])
            .expect("group");
        assert_eq!(groups.len(), 1);
        let (_, targets) = &groups[0];
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].pars, ["frequency", "status"]);
        assert_eq!(targets[1].pars, ["counters"]);
    }

    #[test]
    fn test_group_rejects_bare_device_name() {
        let access = Access::new(Resolver::direct());
        assert!(matches!(
            access.group(&[("justadevice", "par")]),
            Err(Error::Name(_))
        ));
    }
}
