// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! litebus Central Name Service server.
//!
//! A litebus server hosting the `liteCNS` device, which resolves logical
//! device names to `"host;port[;device]"` strings from a YAML map file.
//!
//! # Usage
//!
//! ```bash
//! # Serve the default map file on the default port
//! litebus-cns-server
//!
//! # Custom map, loopback interface, verbose
//! litebus-cns-server -i lo -v litecns.yaml
//! ```

use clap::Parser;
use litebus::{CnsFile, Server, ServerConfig};
use std::path::PathBuf;

mod device;

/// Central Name Service server for litebus.
#[derive(Parser, Debug)]
#[command(name = "litebus-cns-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local interface to bind ("" = primary, "lo" = loopback)
    #[arg(short, long, default_value = "")]
    interface: String,

    /// UDP port to serve
    #[arg(short, long, default_value_t = litebus::config::DEFAULT_PORT)]
    port: u16,

    /// Log verbosity; repeat for more (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// YAML file with the name-resolution map
    #[arg(default_value = "litecns.yaml")]
    lookup: PathBuf,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let file = match CnsFile::load(&args.lookup) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("could not load lookup file {}: {e}", args.lookup.display());
            std::process::exit(1);
        }
    };
    log::info!(
        "serving {} registered names from {}",
        file.hosts.len(),
        args.lookup.display()
    );

    let cns = device::build(file);
    let cfg = ServerConfig {
        interface: args.interface,
        port: args.port,
        ..ServerConfig::default()
    };
    let server = match Server::new(cfg, vec![cns]) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("server startup failed: {e}");
            std::process::exit(1);
        }
    };
    server.run();
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .init();
}
