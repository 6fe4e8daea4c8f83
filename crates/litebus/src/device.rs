// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Devices: named containers of LDOs with lifecycle hooks and a subscriber
//! table.
//!
//! Parameters live in an explicit, declaration-ordered name map; there is no
//! reflective attribute dispatch. Every device carries the required `run` and
//! `status` parameters; `run` drives the [`DeviceLogic`] lifecycle hooks.

use crate::error::{Error, Result};
use crate::ldo::{Ldo, LdoValue, Scalar};
use crate::proto::Target;
use crate::server::ServerShared;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Lifecycle hooks of a device. All default to no-ops; devices override what
/// they need.
///
/// Implementations must be `Send + Sync`: `poll` runs on the server's polling
/// thread while `start`/`stop` run on the broker thread.
pub trait DeviceLogic: Send + Sync {
    fn start(&self, _dev: &Device) {}
    fn stop(&self, _dev: &Device) {}
    /// Called when `Reset` is clicked on the server device.
    fn reset(&self, _dev: &Device) {}
    /// Called by the server's polling thread at `devsPollingInterval`.
    fn poll(&self, _dev: &Device) {}
    fn exit(&self, _dev: &Device) {}
}

/// The default no-op logic.
struct NoLogic;
impl DeviceLogic for NoLogic {}

/// Per-parameter write hook, invoked after a validated assignment.
/// Returning an error reverts the parameter to its previous value.
pub trait SetHook: Send + Sync {
    fn on_set(&self, dev: &Device, name: &str, old: &LdoValue, new: &LdoValue) -> Result<()>;
}

impl<F> SetHook for F
where
    F: Fn(&Device, &str, &LdoValue, &LdoValue) -> Result<()> + Send + Sync,
{
    fn on_set(&self, dev: &Device, name: &str, old: &LdoValue, new: &LdoValue) -> Result<()> {
        self(dev, name, old, new)
    }
}

/// Per-parameter refresh hook, invoked by `get` before the value is read.
pub trait ReadHook: Send + Sync {
    fn refresh(&self, dev: &Device, name: &str) -> Result<()>;
}

impl<F> ReadHook for F
where
    F: Fn(&Device, &str) -> Result<()> + Send + Sync,
{
    fn refresh(&self, dev: &Device, name: &str) -> Result<()> {
        self(dev, name)
    }
}

/// One parameter slot: the LDO behind its own lock, plus optional hooks.
pub(crate) struct ParamEntry {
    name: String,
    ldo: RwLock<Ldo>,
    set_hook: Option<Arc<dyn SetHook>>,
    read_hook: Option<Arc<dyn ReadHook>>,
}

impl ParamEntry {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn ldo(&self) -> &RwLock<Ldo> {
        &self.ldo
    }
}

/// One subscriber of a device.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// The targets the client asked for; a device's publish fans the whole
    /// request out through a synthesized `read`.
    pub request: Vec<Target>,
    /// Consecutive failed deliveries.
    pub items_lost: u32,
    /// Wall-clock seconds of the last successful delivery attempt.
    pub last_delivered: f64,
}

/// A named group of LDOs owned by one server process.
pub struct Device {
    name: String,
    entries: Vec<ParamEntry>,
    logic: Arc<dyn DeviceLogic>,
    subscribers: DashMap<SocketAddr, Subscription>,
    /// f64 bits of the last publish time; the change-detection threshold.
    last_publish: AtomicU64,
    server: OnceLock<Weak<ServerShared>>,
}

impl Device {
    /// Start building a device.
    #[must_use]
    pub fn builder(name: &str) -> DeviceBuilder {
        DeviceBuilder {
            name: name.to_string(),
            entries: Vec::new(),
            logic: Arc::new(NoLogic),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter names in declaration order.
    #[must_use]
    pub fn param_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub(crate) fn entry(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Clone of a parameter's current value.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<LdoValue> {
        self.entry(name).map(|e| e.ldo.read().value().clone())
    }

    #[must_use]
    pub fn timestamp(&self, name: &str) -> Option<f64> {
        self.entry(name).map(|e| e.ldo.read().timestamp())
    }

    /// Direct value+timestamp write, bypassing validation and hooks. The
    /// production path for device data threads.
    pub fn set_value_ts(&self, name: &str, value: LdoValue, timestamp: f64) -> Result<()> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::Name(format!("no such parameter: {}:{name}", self.name)))?;
        entry.ldo.write().set_value_and_timestamp(value, timestamp);
        Ok(())
    }

    /// The broker's `set` path: validate, assign, then run the hook (or the
    /// `run` transition). A hook failure reverts the value and propagates.
    pub fn set_param(&self, name: &str, incoming: LdoValue) -> Result<LdoValue> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::Name(format!("no such parameter: {}:{name}", self.name)))?;
        let (old, new) = {
            let mut ldo = entry.ldo.write();
            let old = ldo.value().clone();
            ldo.set(incoming)?;
            (old, ldo.value().clone())
        };
        let hook_result = if name == "run" {
            self.run_transition(&new)
        } else if let Some(hook) = &entry.set_hook {
            hook.on_set(self, name, &old, &new)
        } else {
            Ok(())
        };
        if let Err(e) = hook_result {
            entry.ldo.write().restore(old);
            return Err(e);
        }
        Ok(entry.ldo.read().value().clone())
    }

    /// `run` is discrete: the accepted token selects the lifecycle hook and
    /// is rewritten to the matching progressive form.
    fn run_transition(&self, new: &LdoValue) -> Result<()> {
        let token = new
            .first_str()
            .ok_or_else(|| Error::Value("run expects a string".into()))?
            .to_string();
        match token.as_str() {
            "Run" => {
                self.logic.start(self);
                self.rewrite_run("Running");
            }
            "Stop" => {
                self.logic.stop(self);
                self.rewrite_run("Stopped");
            }
            "Exit" => {
                log::info!("Exiting server");
                self.logic.exit(self);
                if let Some(shared) = self.shared() {
                    shared.exit.trigger();
                }
            }
            other => {
                return Err(Error::Value(format!(
                    "not accepted setting for \"run\": {other}"
                )))
            }
        }
        Ok(())
    }

    fn rewrite_run(&self, state: &str) {
        if let Some(entry) = self.entry("run") {
            let mut ldo = entry.ldo.write();
            let ts = ldo.timestamp();
            ldo.set_value_and_timestamp(LdoValue::text(state), ts);
        }
    }

    /// Run the parameter's read hook, if any (the `get` refresh path).
    pub fn refresh_param(&self, name: &str) -> Result<()> {
        if let Some(entry) = self.entry(name) {
            if let Some(hook) = &entry.read_hook {
                return hook.refresh(self, name);
            }
        }
        Ok(())
    }

    // ===== Subscriptions =====

    /// Register (or extend) a subscriber. A `*` parameter attaches to the
    /// device's master parameter, the first readable one.
    pub fn register_subscriber(&self, client: SocketAddr, request: Vec<Target>) {
        if let Some(first) = request.first() {
            if first.pars.first().map(String::as_str) == Some("*") {
                if let Some(master) = self
                    .entries
                    .iter()
                    .find(|e| e.ldo.read().is_readable())
                    .map(ParamEntry::name)
                {
                    log::info!("The master parameter: {master}");
                }
            }
        }
        match self.subscribers.get_mut(&client) {
            Some(mut existing) => {
                existing.request.extend(request);
                log::debug!("subscription of {client} to {} extended", self.name);
            }
            None => {
                self.subscribers.insert(
                    client,
                    Subscription {
                        request,
                        items_lost: 0,
                        last_delivered: 0.0,
                    },
                );
                log::debug!(
                    "subscription {}#{} added: {client}",
                    self.name,
                    self.subscribers.len()
                );
            }
        }
        self.mark_clients_dirty();
    }

    /// Drop the client's subscription, if present.
    pub fn unsubscribe(&self, client: &SocketAddr) {
        if self.subscribers.remove(client).is_some() {
            log::info!("subscriptions cancelled for {client} on {}", self.name);
            self.mark_clients_dirty();
        }
    }

    /// (sockets, subscribed items) of this device.
    #[must_use]
    pub fn subscriber_stats(&self) -> (usize, usize) {
        let sockets = self.subscribers.len();
        let items = self
            .subscribers
            .iter()
            .map(|entry| entry.value().request.len())
            .sum();
        (sockets, items)
    }

    pub(crate) fn subscribers(&self) -> &DashMap<SocketAddr, Subscription> {
        &self.subscribers
    }

    #[must_use]
    pub fn last_publish(&self) -> f64 {
        f64::from_bits(self.last_publish.load(Ordering::Acquire))
    }

    pub(crate) fn set_last_publish(&self, ts: f64) {
        self.last_publish.store(ts.to_bits(), Ordering::Release);
    }

    /// Push fresh data to this device's subscribers. Parameters whose
    /// timestamp has not advanced since the last publish are shed by the
    /// synthesized `read`. Returns the bytes shipped.
    pub fn publish(&self) -> usize {
        match self.shared() {
            Some(shared) => crate::server::publish_device(&shared, self),
            None => 0,
        }
    }

    pub(crate) fn attach_server(&self, shared: &Arc<ServerShared>) {
        let _ = self.server.set(Arc::downgrade(shared));
    }

    pub(crate) fn shared(&self) -> Option<Arc<ServerShared>> {
        self.server.get().and_then(Weak::upgrade)
    }

    fn mark_clients_dirty(&self) {
        if let Some(shared) = self.shared() {
            shared
                .clients_dirty
                .store(true, std::sync::atomic::Ordering::Release);
        }
    }

    pub(crate) fn logic(&self) -> &Arc<dyn DeviceLogic> {
        &self.logic
    }
}

/// Builder for [`Device`]; parameters keep their declaration order.
pub struct DeviceBuilder {
    name: String,
    entries: Vec<ParamEntry>,
    logic: Arc<dyn DeviceLogic>,
}

impl DeviceBuilder {
    #[must_use]
    pub fn param(mut self, name: &str, ldo: Ldo) -> Self {
        self.entries.push(ParamEntry {
            name: name.to_string(),
            ldo: RwLock::new(ldo),
            set_hook: None,
            read_hook: None,
        });
        self
    }

    /// Attach a write hook to an already-declared parameter.
    #[must_use]
    pub fn set_hook(mut self, name: &str, hook: impl SetHook + 'static) -> Self {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.set_hook = Some(Arc::new(hook));
        }
        self
    }

    /// Attach a refresh hook to an already-declared parameter.
    #[must_use]
    pub fn read_hook(mut self, name: &str, hook: impl ReadHook + 'static) -> Self {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.read_hook = Some(Arc::new(hook));
        }
        self
    }

    #[must_use]
    pub fn logic(mut self, logic: Arc<dyn DeviceLogic>) -> Self {
        self.logic = logic;
        self
    }

    /// Finish a regular device.
    #[must_use]
    pub fn build(self) -> Arc<Device> {
        self.build_inner(false)
    }

    /// Finish the unique server device; its `run` additionally accepts Exit.
    pub(crate) fn build_server(self) -> Arc<Device> {
        self.build_inner(true)
    }

    fn build_inner(self, is_server: bool) -> Arc<Device> {
        let mut entries = Vec::with_capacity(self.entries.len() + 2);
        let mut legal = vec![Scalar::text("Run"), Scalar::text("Stop")];
        if is_server {
            legal.push(Scalar::text("Exit"));
        }
        if !self.entries.iter().any(|e| e.name == "run") {
            entries.push(ParamEntry {
                name: "run".to_string(),
                ldo: RwLock::new(
                    Ldo::new("RWE", "Stop/Run/Exit", LdoValue::text("Running"))
                        .with_legal_values(legal),
                ),
                set_hook: None,
                read_hook: None,
            });
        }
        if !self.entries.iter().any(|e| e.name == "status") {
            entries.push(ParamEntry {
                name: "status".to_string(),
                ldo: RwLock::new(Ldo::new("RWE", "Device status", LdoValue::text(""))),
                set_hook: None,
                read_hook: None,
            });
        }
        entries.extend(self.entries);
        for entry in &entries {
            log::debug!("PV {}:{}", self.name, entry.name);
        }
        Arc::new(Device {
            name: self.name,
            entries,
            logic: self.logic,
            subscribers: DashMap::new(),
            last_publish: AtomicU64::new(0.0f64.to_bits()),
            server: OnceLock::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_ts;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().expect("socket addr")
    }

    #[test]
    fn test_builder_injects_required_parameters_first() {
        let dev = Device::builder("dev1")
            .param("frequency", Ldo::new("RWE", "f", LdoValue::floats([1.0])))
            .build();
        assert_eq!(dev.param_names(), ["run", "status", "frequency"]);
    }

    #[test]
    fn test_run_exit_rejected_on_regular_device() {
        let dev = Device::builder("dev1").build();
        assert!(dev.set_param("run", LdoValue::text("Exit")).is_err());
        assert_eq!(dev.value("run"), Some(LdoValue::text("Running")));
    }

    struct CountingLogic {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl DeviceLogic for CountingLogic {
        fn start(&self, _dev: &Device) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self, _dev: &Device) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_run_transitions_invoke_logic_and_rewrite_state() {
        let logic = Arc::new(CountingLogic {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        });
        let dev = Device::builder("dev1").logic(logic.clone()).build();

        let result = dev.set_param("run", LdoValue::text("Stop")).expect("stop");
        assert_eq!(result, LdoValue::text("Stopped"));
        assert_eq!(logic.stopped.load(Ordering::SeqCst), 1);

        let result = dev.set_param("run", LdoValue::text("Run")).expect("run");
        assert_eq!(result, LdoValue::text("Running"));
        assert_eq!(logic.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_hook_failure_reverts_value() {
        let dev = Device::builder("dev1")
            .param("frequency", Ldo::new("RWE", "f", LdoValue::floats([1.0])))
            .set_hook("frequency", |_dev: &Device, _name: &str, _old: &LdoValue, new: &LdoValue| {
                if matches!(new, LdoValue::Floats(v) if v[0] > 5.0) {
                    Err(Error::Value("hardware refused".into()))
                } else {
                    Ok(())
                }
            })
            .build();

        dev.set_param("frequency", LdoValue::floats([2.0]))
            .expect("accepted set");
        assert_eq!(dev.value("frequency"), Some(LdoValue::floats([2.0])));

        assert!(dev.set_param("frequency", LdoValue::floats([9.0])).is_err());
        assert_eq!(dev.value("frequency"), Some(LdoValue::floats([2.0])));
    }

    #[test]
    fn test_read_hook_refreshes_value() {
        let dev = Device::builder("dev1")
            .param("time", Ldo::new("R", "Current time", LdoValue::floats([0.0])))
            .read_hook("time", |dev: &Device, name: &str| {
                dev.set_value_ts(name, LdoValue::floats([now_ts()]), now_ts())
            })
            .build();
        dev.refresh_param("time").expect("refresh");
        match dev.value("time") {
            Some(LdoValue::Floats(v)) => assert!(v[0] > 1.0e9),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_subscriber_registration_and_stats() {
        let dev = Device::builder("dev1")
            .param("counters", Ldo::new("R", "c", LdoValue::ints([0])))
            .build();
        let a = client(4001);
        let b = client(4002);
        dev.register_subscriber(a, vec![Target::new("h:dev1", vec!["counters".to_string()])]);
        dev.register_subscriber(b, vec![Target::new("h:dev1", vec!["*".to_string()])]);
        assert_eq!(dev.subscriber_stats(), (2, 2));

        // A second subscribe from the same client extends its request.
        dev.register_subscriber(a, vec![Target::new("h:dev1", vec!["status".to_string()])]);
        assert_eq!(dev.subscriber_stats(), (2, 3));

        dev.unsubscribe(&a);
        assert_eq!(dev.subscriber_stats(), (1, 1));
        dev.unsubscribe(&a); // idempotent
        assert_eq!(dev.subscriber_stats(), (1, 1));
    }

    #[test]
    fn test_publish_without_server_is_a_noop() {
        let dev = Device::builder("dev1").build();
        assert_eq!(dev.publish(), 0);
    }

    #[test]
    fn test_set_value_ts_bypasses_validation() {
        let dev = Device::builder("dev1")
            .param(
                "frequency",
                Ldo::new("R", "f", LdoValue::floats([1.0])).with_op_limits(Some(0.0), Some(2.0)),
            )
            .build();
        // Not writable and out of limits, but the production path is direct.
        dev.set_value_ts("frequency", LdoValue::floats([99.0]), 123.0)
            .expect("direct write");
        assert_eq!(dev.value("frequency"), Some(LdoValue::floats([99.0])));
        assert_eq!(dev.timestamp("frequency"), Some(123.0));
    }
}
