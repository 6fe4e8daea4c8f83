// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command dispatch and reply assembly.
//!
//! One datagram in, at most one (chunked) reply out. Special short payloads
//! are inspected first: `b"ACK"` clears ack state, a bare beacon is an echo
//! of a past transfer. Everything else decodes as a UBJSON request.
//!
//! Data-path errors never propagate out of this module; they become
//! `"ERR.LS"` reply strings or log lines.

use crate::chunk;
use crate::codec::{self, Value};
use crate::config::{ACK, BEACON, PERF_MIN_BYTES};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::ldo::LdoValue;
use crate::proto::{self, Command, Request, Target};
use crate::server::ack::ChunkMap;
use crate::server::ServerShared;
use crate::util::{crop, now_ts};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Entry point for every datagram received on the server socket.
pub(crate) fn handle_datagram(shared: &Arc<ServerShared>, data: &[u8], client: SocketAddr) {
    if data == ACK {
        // Serialize against an in-flight send to the same client.
        let _guard = shared.send_lock.lock();
        log::debug!("Got ACK from {client}");
        if !shared.acks.clear(&client) {
            log::debug!("no ACK state to clear for {client}");
        }
        return;
    }
    if data == BEACON {
        return;
    }

    let value = match codec::decode(data) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("wrong command format (not ubjson) from {client}: {e}");
            let _ = shared.socket.send_to(&BEACON, client);
            return;
        }
    };
    if value.get("cmd").is_none() {
        log::warn!("'cmd' key missing in request from {client}");
        return;
    }
    let request = match Request::from_value(&value) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("bad request from {client}: {e}");
            send_error(shared, "?", &e, client);
            return;
        }
    };
    update_last_pid(shared, &request, client);
    log::debug!(
        "Got command {} from {client} ({} targets)",
        request.command.as_str(),
        request.targets.len()
    );

    match request.command {
        Command::Unsubscribe => {
            for dev in &shared.devices {
                log::info!("unsubscribing {client} from {}", dev.name());
                dev.unsubscribe(&client);
            }
        }
        Command::Retransmit => handle_retransmit(shared, &request, client),
        Command::Subscribe => handle_subscribe(shared, &request, client),
        Command::Set => {
            if request.targets.len() != 1
                || request.targets[0].device_name() == "*"
            {
                let err = Error::Value("set is supported for a single device only".into());
                send_error(shared, "set", &err, client);
            } else {
                send_reply(shared, Command::Set, &request.targets, client);
            }
        }
        Command::Info | Command::Get | Command::Read => {
            send_reply(shared, request.command, &request.targets, client);
        }
    }
}

fn handle_retransmit(shared: &Arc<ServerShared>, request: &Request, client: SocketAddr) {
    shared.perf.retransmits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let Some((offset, size)) = request.chunk else {
        return;
    };
    match shared.acks.chunk(&client, offset, size) {
        Some(datagram) => {
            log::info!("retransmitting chunk ({offset},{size}) to {client}");
            if let Err(e) = shared.socket.send_to(&datagram, client) {
                log::warn!("retransmit to {client} failed: {e}");
            }
        }
        None => {
            log::error!("no pending chunk ({offset},{size}) for {client}");
        }
    }
}

fn handle_subscribe(shared: &Arc<ServerShared>, request: &Request, client: SocketAddr) {
    let Some(first) = request.targets.first() else {
        let err = Error::Protocol(
            "subscription should be of the form [[host:dev, [parameters]]]".into(),
        );
        send_error(shared, "subscribe", &err, client);
        return;
    };
    let dev_name = first.device_name().to_string();
    if dev_name == "*" {
        let err = Error::Name("cannot subscribe to device \"*\"".into());
        send_error(shared, "subscribe", &err, client);
        return;
    }
    match shared.device(&dev_name) {
        Some(dev) => {
            log::debug!("register_subscriber {client} on {dev_name}");
            dev.register_subscriber(client, request.targets.clone());
        }
        None => {
            let err = Error::Name(format!("device {dev_name} not served"));
            send_error(shared, "subscribe", &err, client);
        }
    }
}

/// Store the previous requester's identity in `server:lastPID` and remember
/// the current one.
fn update_last_pid(shared: &Arc<ServerShared>, request: &Request, client: SocketAddr) {
    let mut prev = shared.last_pid.lock();
    if let Some(sysdev) = shared.device("server") {
        let ts = sysdev.timestamp("lastPID").unwrap_or_else(now_ts);
        let _ = sysdev.set_value_ts("lastPID", LdoValue::text(prev.clone()), ts);
    }
    *prev = format!(
        "{};{} {} {}",
        client.ip(),
        client.port(),
        request.pid,
        request.username
    );
}

// ============================================================================
// REPLY ASSEMBLY
// ============================================================================

/// Build and ship a reply for `info`/`get`/`read`/`set`. An empty reply map
/// sends nothing (this is how an unchanged `read` sheds traffic). Returns
/// bytes shipped.
pub(crate) fn send_reply(
    shared: &Arc<ServerShared>,
    command: Command,
    targets: &[Target],
    client: SocketAddr,
) -> usize {
    let reply = match reply_data(shared, command, targets) {
        Ok(Value::Object(pairs)) if pairs.is_empty() => return 0,
        Ok(v) => v,
        Err(e) => {
            log::info!("error reply for {} to {client}: {e}", command.as_str());
            proto::error_reply(command.as_str(), &e)
        }
    };
    let buf = codec::encode(&reply);
    send_chunked(shared, &buf, client)
}

/// The reply map for one command over its targets.
fn reply_data(shared: &Arc<ServerShared>, command: Command, targets: &[Target]) -> Result<Value> {
    if targets.is_empty() {
        // A bare `info` lists the served devices.
        if command == Command::Info {
            return Ok(Value::Array(
                shared
                    .devices
                    .iter()
                    .map(|d| Value::str(d.name()))
                    .collect(),
            ));
        }
        return Err(Error::Protocol("expect cmd,args".into()));
    }
    let mut pairs: Vec<(String, Value)> = Vec::new();
    for target in targets {
        let dev_name = target.device_name();
        if dev_name == "*" {
            let host_part = &target.cns_dev[..target.cns_dev.len() - dev_name.len()];
            for dev in &shared.devices {
                let cns_dev = format!("{host_part}{}", dev.name());
                process_target(dev, &cns_dev, command, target, &mut pairs)?;
            }
        } else {
            let dev = shared
                .device(dev_name)
                .ok_or_else(|| Error::Name(format!("device {} not served", target.cns_dev)))?;
            process_target(&dev, &target.cns_dev, command, target, &mut pairs)?;
        }
    }
    Ok(Value::Object(pairs))
}

/// Fill `pairs` with this target's parameters on one device.
fn process_target(
    dev: &Arc<Device>,
    cns_dev: &str,
    command: Command,
    target: &Target,
    pairs: &mut Vec<(String, Value)>,
) -> Result<()> {
    let par_names: Vec<String> = if target.pars.first().map(String::as_str) == Some("*") {
        dev.param_names()
    } else {
        target.pars.clone()
    };

    for (idx, par) in par_names.iter().enumerate() {
        let Some(entry) = dev.entry(par) else {
            log::warn!("No such name: {cns_dev}:{par}");
            continue;
        };
        match command {
            Command::Get | Command::Read => {
                if command == Command::Read {
                    let ldo = entry.ldo().read();
                    if !ldo.is_readable() {
                        continue;
                    }
                    // The change filter: only advanced timestamps travel.
                    if ldo.timestamp() <= dev.last_publish() {
                        continue;
                    }
                } else {
                    dev.refresh_param(par)?;
                }
                let ldo = entry.ldo().read();
                let prop = target.props.first().map(String::as_str).unwrap_or("value");
                let mut par_pairs = if prop == "value" {
                    ldo.value().to_wire_pairs()
                } else {
                    match ldo.property(prop) {
                        Some(v) => vec![("value".to_string(), v)],
                        None => {
                            log::warn!("no property {prop} on {cns_dev}:{par}");
                            continue;
                        }
                    }
                };
                par_pairs.push(("timestamp".to_string(), Value::Float(ldo.timestamp())));
                pairs.push((proto::reply_key(cns_dev, par), Value::Object(par_pairs)));
            }
            Command::Info => {
                let ldo = entry.ldo().read();
                let own_props = ldo.info_properties();
                let selected: Vec<&str> =
                    if target.props.is_empty() || target.props[0] == "*" {
                        own_props
                    } else {
                        target.props.iter().map(String::as_str).collect()
                    };
                let mut par_pairs: Vec<(String, Value)> = Vec::with_capacity(selected.len());
                for prop in selected {
                    if prop == "value" {
                        par_pairs.extend(ldo.value().to_wire_pairs());
                    } else if let Some(v) = ldo.property(prop) {
                        par_pairs.push((prop.to_string(), v));
                    }
                }
                pairs.push((proto::reply_key(cns_dev, par), Value::Object(par_pairs)));
            }
            Command::Set => {
                let vals = target
                    .vals
                    .as_ref()
                    .ok_or_else(|| Error::Name("set value missing".into()))?;
                let raw = if par_names.len() > 1 {
                    vals.as_array()
                        .and_then(|a| a.get(idx))
                        .ok_or_else(|| Error::Name("set value missing".into()))?
                        .clone()
                } else {
                    vals.clone()
                };
                let incoming = LdoValue::from_wire(&raw, None)?;
                log::debug!("set {}:{par}", dev.name());
                let new_value = dev.set_param(par, incoming)?;
                let mut par_pairs = new_value.to_wire_pairs();
                if let Some(ts) = dev.timestamp(par) {
                    par_pairs.push(("timestamp".to_string(), Value::Float(ts)));
                }
                pairs.push((proto::reply_key(cns_dev, par), Value::Object(par_pairs)));
            }
            Command::Subscribe | Command::Unsubscribe | Command::Retransmit => {
                return Err(Error::Protocol(format!(
                    "command \"{}\" has no reply data",
                    command.as_str()
                )));
            }
        }
    }
    Ok(())
}

// ============================================================================
// CHUNKED SEND
// ============================================================================

/// Chunk a reply, ship it in descending offset order, and register the
/// chunks for acknowledgment. The send-and-register sequence holds the send
/// lock so two publishers cannot interleave datagrams to one client.
pub(crate) fn send_chunked(shared: &ServerShared, buf: &[u8], client: SocketAddr) -> usize {
    if buf.is_empty() {
        return 0;
    }
    // An unacknowledged previous delivery blocks this one; wait it out
    // before taking the lock so ACK processing stays live.
    if shared.acks.is_outstanding(&client) {
        log::warn!("previous delivery to {client} still unacknowledged, waiting");
        let mut rounds = shared.cfg.max_ack_count;
        while rounds > 0 && shared.acks.is_outstanding(&client) {
            if shared.exit.wait_timeout(shared.cfg.ack_interval) {
                return 0;
            }
            rounds -= 1;
        }
        if shared.acks.is_outstanding(&client) {
            log::error!("send to {client} abandoned, client is not acknowledging");
            return 0;
        }
    }

    let started = Instant::now();
    let _guard = shared.send_lock.lock();
    let chunks = chunk::split(buf, shared.cfg.chunk_size);
    let multi = chunks.len() > 1;
    let mut chunk_map = ChunkMap::with_capacity(chunks.len());
    for c in &chunks {
        if let Err(e) = shared.socket.send_to(&c.datagram, client) {
            log::warn!("send of chunk {} to {client} failed: {e}", c.offset);
            return 0;
        }
        chunk_map.insert((c.offset, c.size), c.datagram.clone());
        if multi && !shared.cfg.chunk_sleep.is_zero() {
            std::thread::sleep(shared.cfg.chunk_sleep);
        }
    }
    if !shared.acks.register(client, chunk_map, shared.cfg.max_ack_count) {
        return 0;
    }
    if buf.len() > PERF_MIN_BYTES {
        shared.perf.record_send(buf.len(), started.elapsed());
    }
    log::debug!("sent {} bytes to {client} in {} chunks", buf.len(), chunks.len());
    buf.len()
}

// ============================================================================
// PUBLISH
// ============================================================================

/// Serve one device's subscribers with a change-filtered `read` reply.
///
/// Serialized by the process-wide publish lock so no two devices emit at the
/// same time. Returns bytes shipped.
pub(crate) fn publish_device(shared: &Arc<ServerShared>, dev: &Device) -> usize {
    if dev.subscribers().is_empty() {
        return 0;
    }
    let guard = match shared.publish_lock.try_lock() {
        Some(guard) => guard,
        None => {
            let waited = Instant::now();
            let guard = shared.publish_lock.lock();
            log::info!(
                "publishing for {} was unblocked after {:.6}s",
                dev.name(),
                waited.elapsed().as_secs_f64()
            );
            guard
        }
    };
    let current_time = now_ts();
    let mut shipped = 0usize;
    let clients: Vec<SocketAddr> = dev.subscribers().iter().map(|e| *e.key()).collect();
    for client in clients {
        if shared.acks.is_outstanding(&client) {
            // Previous delivery still pending: count it, maybe evict.
            shared
                .perf
                .dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            log::debug!(
                "posting to {client} dropped, previous delivery unacknowledged"
            );
            if shared.acks.countdown(&client).is_some_and(|c| c <= 0) {
                let lost = match dev.subscribers().get_mut(&client) {
                    Some(mut sub) => {
                        sub.items_lost += 1;
                        shared.perf.items_lost.fetch_add(
                            u64::from(sub.items_lost),
                            std::sync::atomic::Ordering::Relaxed,
                        );
                        sub.items_lost
                    }
                    None => continue,
                };
                log::info!("Client {client} stuck {lost} times in a row");
                shared.acks.reset_countdown(&client, shared.cfg.max_ack_count);
                if lost >= shared.cfg.item_lost_limit {
                    let request = dev
                        .subscribers()
                        .get(&client)
                        .map(|s| format!("{:?}", s.request))
                        .unwrap_or_default();
                    log::warn!(
                        "Subscription to {client} cancelled, it was not acknowledging \
                         for {lost} delivery of: {}",
                        crop(&request, 300)
                    );
                    dev.subscribers().remove(&client);
                    shared.acks.remove(&client);
                    shared
                        .clients_dirty
                        .store(true, std::sync::atomic::Ordering::Release);
                }
            }
            continue;
        }
        let request = match dev.subscribers().get_mut(&client) {
            Some(mut sub) => {
                sub.items_lost = 0;
                sub.last_delivered = current_time;
                sub.request.clone()
            }
            None => continue,
        };
        // A read reply delivers only parameters with advanced timestamps.
        shipped += send_reply(shared, Command::Read, &request, client);
    }
    dev.set_last_publish(now_ts());
    drop(guard);
    if shipped > 0 {
        log::debug!("published {shipped} bytes for {}", dev.name());
    }
    shipped
}

/// Encode and ship an `"ERR.LS"` string reply.
fn send_error(shared: &ServerShared, context: &str, err: &Error, client: SocketAddr) {
    let buf = codec::encode(&proto::error_reply(context, err));
    send_chunked(shared, &buf, client);
}
