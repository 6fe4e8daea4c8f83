// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # litebus - lightweight publish/subscribe access to lite data objects
//!
//! A UDP-based data-access framework for instrumentation and control. A
//! server process hosts named *devices*; each device exposes named
//! *parameters* (LDOs: typed, timestamped values with metadata). Remote
//! clients discover parameters, read and write them synchronously, and
//! subscribe to change-driven updates.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use litebus::{Access, Device, Ldo, LdoValue, Resolver, Server, ServerConfig};
//!
//! fn main() -> litebus::Result<()> {
//!     // Server side: one device with one parameter.
//!     let dev = Device::builder("dev1")
//!         .param("frequency", Ldo::new("RWE", "Cycle frequency", LdoValue::floats([1.0])))
//!         .build();
//!     let server = Server::new(ServerConfig::default(), vec![dev])?;
//!     std::thread::spawn(move || server.run());
//!
//!     // Client side.
//!     let access = Access::new(Resolver::direct());
//!     let reply = access.get(&[("localhost:dev1", "frequency")])?;
//!     println!("{:?}", reply.find("dev1:frequency"));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Client surface                        |
//! |     Access -> target grouping -> per-host transactions       |
//! +--------------------------------------------------------------+
//! |                       Wire protocol                          |
//! |   UBJSON codec | offset-prefixed chunks | ACK / retransmit   |
//! +--------------------------------------------------------------+
//! |                        Server broker                         |
//! |  dispatch | reply assembly | ack tracking | publish pipeline |
//! +--------------------------------------------------------------+
//! |                         Data model                           |
//! |        Device (subscriber table) -> named LDO map            |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Modules overview
//!
//! - [`ldo`] - the parameter model (start here)
//! - [`device`] - devices, lifecycle hooks, subscriber tables
//! - [`server`] - broker, ack tracking, heartbeat
//! - [`access`] - client surface
//! - [`cns`] - logical name resolution
//! - [`codec`] / [`chunk`] / [`proto`] - the wire layer

/// Client access surface (info/get/read/set/subscribe).
pub mod access;
/// Chunked UDP framing and reassembly.
pub mod chunk;
/// Name resolution (static map file or central liteCNS query).
pub mod cns;
/// UBJSON wire codec.
pub mod codec;
/// Protocol constants and server configuration.
pub mod config;
/// Devices: named containers of LDOs.
pub mod device;
/// Error type shared across the crate.
pub mod error;
/// Lite Data Objects: the parameter model.
pub mod ldo;
/// Request/reply shapes on the wire.
pub mod proto;
/// The UDP server: broker, ack tracker, background threads.
pub mod server;
/// Small shared helpers (time, exit event, local IP).
pub mod util;

pub use access::{Access, Reading, Reply};
pub use cns::{CnsFile, HostPort, Resolver};
pub use codec::Value;
pub use config::ServerConfig;
pub use device::{Device, DeviceBuilder, DeviceLogic, ReadHook, SetHook, Subscription};
pub use error::{Error, Result};
pub use ldo::{Dtype, Features, Ldo, LdoValue, NdArray, Scalar};
pub use proto::{Command, Request, Target};
pub use server::Server;
pub use util::ExitEvent;

/// litebus version string, exposed as the server's `version` parameter.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
