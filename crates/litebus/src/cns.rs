// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Name resolution: logical device names to `host:port`.
//!
//! The map file is declarative YAML:
//!
//! ```yaml
//! hosts:
//!   peakSim: "localhost;9701"
//!   polarimeter: "acq7;9700;polar"
//! site_cns: "cnshost;9700"   # optional redirect to a central liteCNS server
//! ```
//!
//! Lookup order: literal `host;port` forms pass through untouched, then the
//! static map, then the cache of central answers, then a query to the
//! central `liteCNS` device. An unresolved name falls back to being used as
//! a hostname with the default port, with a warning.

use crate::access::xact;
use crate::codec::Value;
use crate::config::{CLIENT_TIMEOUT, CNS_DELIMITER, DEFAULT_PORT};
use crate::error::{Error, Result};
use crate::ldo::LdoValue;
use crate::proto::{Command, Request, Target};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::num::NonZeroUsize;
use std::path::Path;

/// Central answers kept per resolver; plenty for one control room.
const CACHE_SIZE: usize = 256;

/// On-disk shape of the name-resolution file.
#[derive(Debug, Deserialize, Default)]
pub struct CnsFile {
    /// `name -> "host;port[;device]"`.
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    /// Redirect every lookup to a central liteCNS server, `"host;port"`.
    #[serde(default)]
    pub site_cns: Option<String>,
}

impl CnsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| Error::Name(format!("bad name map {}: {e}", path.display())))
    }
}

/// Resolved endpoint of a logical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address via DNS.
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::Name(format!("could not resolve host {}: {e}", self.host)))?
            .next()
            .ok_or_else(|| Error::Name(format!("no address for host {}", self.host)))
    }
}

/// Parse a `"host;port[;device]"` resolution string.
fn parse_resolution(text: &str, default_port: u16) -> Result<HostPort> {
    let mut parts = text.split(CNS_DELIMITER);
    let host = parts
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::Name(format!("empty resolution \"{text}\"")))?;
    let port = match parts.next() {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| Error::Name(format!("bad port in resolution \"{text}\"")))?,
        None => default_port,
    };
    Ok(HostPort::new(host, port))
}

/// Client-side name resolver.
pub struct Resolver {
    map: HashMap<String, String>,
    site_cns: Option<HostPort>,
    cache: Mutex<LruCache<String, HostPort>>,
    default_port: u16,
}

impl Resolver {
    /// A resolver with no map: names pass through as hostnames.
    #[must_use]
    pub fn direct() -> Self {
        Self::from_parts(HashMap::new(), None)
    }

    /// Load from a YAML map file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = CnsFile::load(path)?;
        let site_cns = match file.site_cns.as_deref() {
            Some(text) => Some(parse_resolution(text, DEFAULT_PORT)?),
            None => None,
        };
        log::info!(
            "name resolution using {} ({} entries{})",
            path.display(),
            file.hosts.len(),
            if site_cns.is_some() { ", site redirect" } else { "" }
        );
        Ok(Self::from_parts(file.hosts, site_cns))
    }

    #[must_use]
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self::from_parts(map, None)
    }

    fn from_parts(map: HashMap<String, String>, site_cns: Option<HostPort>) -> Self {
        let cache_size = NonZeroUsize::new(CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            map,
            site_cns,
            cache: Mutex::new(LruCache::new(cache_size)),
            default_port: DEFAULT_PORT,
        }
    }

    /// Resolve a logical name (the host part of `name:device`).
    pub fn resolve(&self, name: &str) -> Result<HostPort> {
        // Literal forms need no service.
        if name.contains(CNS_DELIMITER) {
            return parse_resolution(name, self.default_port);
        }
        if name.eq_ignore_ascii_case("localhost") {
            return Ok(HostPort::new("127.0.0.1", self.default_port));
        }
        if name.is_empty() {
            return Ok(HostPort::new(
                crate::util::local_ip("")?,
                self.default_port,
            ));
        }
        if let Some(resolution) = self.map.get(name) {
            return parse_resolution(resolution, self.default_port);
        }
        if let Some(hit) = self.cache.lock().get(name).cloned() {
            return Ok(hit);
        }
        if let Some(site) = &self.site_cns {
            let resolution = query_central(site, name)?;
            let resolved = parse_resolution(&resolution, self.default_port)?;
            self.cache.lock().put(name.to_string(), resolved.clone());
            return Ok(resolved);
        }
        log::warn!("name {name} is not in the name map, trying to use it as a hostname");
        Ok(HostPort::new(name, self.default_port))
    }
}

/// Ask the central liteCNS server for a name: a `set` of the name onto its
/// `query` parameter; the reply carries the resolution in `query`'s value.
fn query_central(site: &HostPort, name: &str) -> Result<String> {
    let server = site.to_socket_addr()?;
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(CLIENT_TIMEOUT))?;

    let mut target = Target::new(
        format!("{}:liteCNS", site.host),
        vec!["query".to_string()],
    );
    target.props = vec!["value".to_string()];
    target.vals = Some(Value::Array(vec![Value::str(name)]));
    let request = Request::new(Command::Set, vec![target]);

    let reply = xact::transact(&socket, server, &request)?;
    let pairs = reply
        .as_object()
        .ok_or_else(|| Error::Name(format!("unexpected liteCNS reply for {name}")))?;
    let (_, entry) = pairs
        .iter()
        .find(|(k, _)| k.ends_with(":query"))
        .ok_or_else(|| Error::Name(format!("no query entry in liteCNS reply for {name}")))?;
    let answer = entry
        .get("value")
        .map(|v| LdoValue::from_wire(v, None))
        .transpose()?
        .and_then(|v| v.first_str().map(str::to_string))
        .ok_or_else(|| Error::Name(format!("malformed liteCNS answer for {name}")))?;
    if answer.starts_with("ERROR") {
        return Err(Error::Name(answer));
    }
    Ok(answer)
}
