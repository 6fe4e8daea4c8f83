// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! litebusctl - command-line access to litebus servers.
//!
//! ```bash
//! # Everything the server device exposes
//! litebusctl info localhost:server
//!
//! # One parameter's value
//! litebusctl get localhost:dev1 frequency
//!
//! # Set it
//! litebusctl set localhost:dev1 frequency 2.5
//!
//! # Watch publications for ten seconds
//! litebusctl subscribe localhost:dev1 cycle -s 10
//! ```

use clap::{Parser, Subcommand};
use litebus::{Access, LdoValue, Reading, Reply, Resolver, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line access to litebus parameters.
#[derive(Parser, Debug)]
#[command(name = "litebusctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    /// Name-resolution YAML file (defaults to direct host names)
    #[arg(short, long, global = true)]
    cns: Option<PathBuf>,

    /// Transaction timeout in seconds
    #[arg(short, long, default_value = "10", global = true)]
    timeout: u64,

    /// Log verbosity; repeat for more (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List the devices a host serves
    Devices {
        /// Host name or "host;port"
        host: String,
    },

    /// Show parameter metadata
    Info {
        /// Target device, "host:device"
        device: String,
        /// Parameters (default: all)
        #[arg(default_value = "*")]
        pars: Vec<String>,
    },

    /// Read current values (refreshes lazily polled parameters)
    Get {
        device: String,
        #[arg(default_value = "*")]
        pars: Vec<String>,
    },

    /// Read only readable parameters with advanced timestamps
    Read {
        device: String,
        #[arg(default_value = "*")]
        pars: Vec<String>,
    },

    /// Set one parameter
    Set {
        device: String,
        par: String,
        /// Values; numbers are sent as numbers, anything else as strings
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Subscribe and print publications for a bounded time
    Subscribe {
        device: String,
        #[arg(default_value = "*")]
        pars: Vec<String>,
        /// Seconds to watch before unsubscribing
        #[arg(short, long, default_value = "30")]
        seconds: u64,
    },
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let resolver = match &args.cns {
        Some(path) => match Resolver::from_file(path) {
            Ok(resolver) => resolver,
            Err(e) => {
                eprintln!("could not load name map {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => Resolver::direct(),
    };
    let access = Access::new(resolver).with_timeout(Duration::from_secs(args.timeout));

    let outcome = match args.command {
        Cmd::Devices { host } => run_devices(&access, &host),
        Cmd::Info { device, pars } => access
            .info(&to_targets(&device, &pars))
            .map(|reply| print_reply(&reply, true)),
        Cmd::Get { device, pars } => access
            .get(&to_targets(&device, &pars))
            .map(|reply| print_reply(&reply, false)),
        Cmd::Read { device, pars } => access
            .read(&to_targets(&device, &pars))
            .map(|reply| print_reply(&reply, false)),
        Cmd::Set {
            device,
            par,
            values,
        } => access
            .set(&device, &par, parse_values(&values))
            .map(|reply| print_reply(&reply, false)),
        Cmd::Subscribe {
            device,
            pars,
            seconds,
        } => run_subscribe(&access, &device, &pars, seconds),
    };

    if let Err(e) = outcome {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run_devices(access: &Access, host: &str) -> litebus::Result<()> {
    for name in access.list_devices(host)? {
        println!("{name}");
    }
    Ok(())
}

fn run_subscribe(
    access: &Access,
    device: &str,
    pars: &[String],
    seconds: u64,
) -> litebus::Result<()> {
    access.subscribe(&to_targets(device, pars), |reply| {
        print_reply(&reply, false);
    })?;
    std::thread::sleep(Duration::from_secs(seconds));
    access.unsubscribe_all();
    Ok(())
}

fn to_targets<'a>(device: &'a str, pars: &'a [String]) -> Vec<(&'a str, &'a str)> {
    pars.iter().map(|p| (device, p.as_str())).collect()
}

/// Numbers become numbers, `true`/`false` booleans, the rest strings.
fn parse_values(values: &[String]) -> LdoValue {
    if values.iter().all(|v| v.parse::<i64>().is_ok()) {
        return LdoValue::Ints(values.iter().filter_map(|v| v.parse().ok()).collect());
    }
    if values.iter().all(|v| v.parse::<f64>().is_ok()) {
        return LdoValue::Floats(values.iter().filter_map(|v| v.parse().ok()).collect());
    }
    if values.iter().all(|v| v == "true" || v == "false") {
        return LdoValue::Bools(values.iter().map(|v| v == "true").collect());
    }
    LdoValue::Strs(values.to_vec())
}

fn print_reply(reply: &Reply, with_props: bool) {
    if reply.is_empty() {
        println!("(empty reply)");
        return;
    }
    for (key, reading) in reply.iter() {
        println!("{key} = {}", format_reading(reading));
        if with_props {
            for (prop, value) in &reading.props {
                println!("    {prop}: {}", format_value(value));
            }
        }
    }
}

fn format_reading(reading: &Reading) -> String {
    let ts = reading
        .timestamp
        .map(|t| format!(" @{t:.6}"))
        .unwrap_or_default();
    format!("{}{ts}", format_ldo_value(&reading.value))
}

fn format_ldo_value(value: &LdoValue) -> String {
    match value {
        LdoValue::Null => "null".to_string(),
        LdoValue::Ints(v) => format!("{v:?}"),
        LdoValue::Floats(v) => format!("{v:?}"),
        LdoValue::Bools(v) => format!("{v:?}"),
        LdoValue::Strs(v) => format!("{v:?}"),
        LdoValue::Array(a) => format!(
            "<{} array, shape {:?}, {} bytes>",
            a.dtype.as_str(),
            a.shape,
            a.data.len()
        ),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(x) => x.to_string(),
        Value::Str(s) => s.clone(),
        Value::Bytes(b) => format!("<{} bytes>", b.len()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(format_value).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Object(pairs) => format!("<map of {}>", pairs.len()),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .init();
}
