// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request and reply shapes on top of the UBJSON codec.
//!
//! A request is a map
//! `{"cmd": [command, args], "username": str, "program": str, "pid": int}`.
//! `args` is a sequence of `[cnsDevName, specifier]` targets, except for
//! `retransmit`, whose args are a bare `[offset, length]` pair.
//!
//! Replies are maps keyed `"host:device:parameter"`; error replies are bare
//! strings starting with `"ERR.LS"`.

use crate::codec::Value;
use crate::config::{ERR_PREFIX, NS_DELIMITER};
use crate::error::{Error, Result};

/// Commands understood by the broker, with their exact wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Info,
    Get,
    Read,
    Set,
    Subscribe,
    Unsubscribe,
    Retransmit,
}

impl Command {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "info" => Ok(Command::Info),
            "get" => Ok(Command::Get),
            "read" => Ok(Command::Read),
            "set" => Ok(Command::Set),
            "subscribe" => Ok(Command::Subscribe),
            "unsubscribe" => Ok(Command::Unsubscribe),
            "retransmit" => Ok(Command::Retransmit),
            other => Err(Error::Protocol(format!("command \"{other}\" not accepted"))),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Info => "info",
            Command::Get => "get",
            Command::Read => "read",
            Command::Set => "set",
            Command::Subscribe => "subscribe",
            Command::Unsubscribe => "unsubscribe",
            Command::Retransmit => "retransmit",
        }
    }
}

/// One `[cnsDevName, specifier]` element of a request's args.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// `"host:device"` exactly as the client spelled it; reply keys reuse it.
    pub cns_dev: String,
    /// Requested parameter names; `"*"` expands to all.
    pub pars: Vec<String>,
    /// Requested properties; empty means the per-command default.
    pub props: Vec<String>,
    /// Values for `set`.
    pub vals: Option<Value>,
}

impl Target {
    #[must_use]
    pub fn new(cns_dev: impl Into<String>, pars: Vec<String>) -> Self {
        Self {
            cns_dev: cns_dev.into(),
            pars,
            props: Vec::new(),
            vals: None,
        }
    }

    /// The device component: everything after the last `:`.
    #[must_use]
    pub fn device_name(&self) -> &str {
        match self.cns_dev.rfind(NS_DELIMITER) {
            Some(pos) => &self.cns_dev[pos + 1..],
            None => &self.cns_dev,
        }
    }

    fn to_value(&self) -> Value {
        let mut specifier = vec![Value::Array(
            self.pars.iter().map(|p| Value::str(p.clone())).collect(),
        )];
        if !self.props.is_empty() || self.vals.is_some() {
            specifier.push(Value::Array(
                self.props.iter().map(|p| Value::str(p.clone())).collect(),
            ));
        }
        if let Some(vals) = &self.vals {
            specifier.push(vals.clone());
        }
        Value::Array(vec![
            Value::str(self.cns_dev.clone()),
            Value::Array(specifier),
        ])
    }

    fn from_value(value: &Value) -> Result<Self> {
        let pair = value
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| Error::Protocol("target must be [cnsDevName, specifier]".into()))?;
        let cns_dev = pair[0]
            .as_str()
            .ok_or_else(|| Error::Protocol("cnsDevName must be a string".into()))?
            .to_string();
        let specifier = pair[1]
            .as_array()
            .ok_or_else(|| Error::Protocol("specifier must be a sequence".into()))?;
        if specifier.is_empty() {
            return Err(Error::Protocol("empty specifier".into()));
        }
        let pars = string_list(&specifier[0])
            .ok_or_else(|| Error::Protocol("parameter list must hold strings".into()))?;
        let props = match specifier.get(1) {
            None => Vec::new(),
            Some(v) => string_list(v)
                .ok_or_else(|| Error::Protocol("property list must hold strings".into()))?
                .into_iter()
                // "v" is the historical alias for "value".
                .map(|p| if p == "v" { "value".to_string() } else { p })
                .collect(),
        };
        let vals = specifier.get(2).cloned();
        Ok(Self {
            cns_dev,
            pars,
            props,
            vals,
        })
    }
}

/// A string, or a sequence of strings, normalized to a vec.
fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Str(s) => Some(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

/// A decoded request.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: Command,
    pub targets: Vec<Target>,
    /// `(offset, size)` of the chunk a `retransmit` asks for.
    pub chunk: Option<(u32, u32)>,
    pub username: String,
    pub program: String,
    pub pid: i64,
}

impl Request {
    #[must_use]
    pub fn new(command: Command, targets: Vec<Target>) -> Self {
        Self {
            command,
            targets,
            chunk: None,
            username: String::new(),
            program: String::new(),
            pid: 0,
        }
    }

    #[must_use]
    pub fn retransmit(offset: u32, size: u32) -> Self {
        Self {
            command: Command::Retransmit,
            targets: Vec::new(),
            chunk: Some((offset, size)),
            username: String::new(),
            program: String::new(),
            pid: 0,
        }
    }

    /// Serialize for the wire.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let args = match self.chunk {
            Some((offset, size)) => Value::Array(vec![
                Value::Int(i64::from(offset)),
                Value::Int(i64::from(size)),
            ]),
            None => Value::Array(self.targets.iter().map(Target::to_value).collect()),
        };
        let mut pairs = vec![(
            "cmd".to_string(),
            Value::Array(vec![Value::str(self.command.as_str()), args]),
        )];
        if !self.username.is_empty() {
            pairs.push(("username".to_string(), Value::str(self.username.clone())));
            pairs.push(("program".to_string(), Value::str(self.program.clone())));
            pairs.push(("pid".to_string(), Value::Int(self.pid)));
        }
        Value::Object(pairs)
    }

    /// Parse a decoded datagram into a request.
    pub fn from_value(value: &Value) -> Result<Self> {
        let cmd = value
            .get("cmd")
            .ok_or_else(|| Error::Protocol("\"cmd\" key missing in request".into()))?;
        let cmd_args = cmd
            .as_array()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::Protocol("\"cmd\" must be [command, args]".into()))?;
        let command = Command::parse(
            cmd_args[0]
                .as_str()
                .ok_or_else(|| Error::Protocol("command must be a string".into()))?,
        )?;

        let mut request = Request::new(command, Vec::new());
        request.username = value
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        request.program = value
            .get("program")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        request.pid = value.get("pid").and_then(Value::as_i64).unwrap_or(0);

        let args = cmd_args.get(1);
        match command {
            Command::Retransmit => {
                let pair = args
                    .and_then(Value::as_array)
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| {
                        Error::Protocol("retransmit args must be [offset, length]".into())
                    })?;
                let offset = pair[0]
                    .as_i64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| Error::Protocol("bad retransmit offset".into()))?;
                let size = pair[1]
                    .as_i64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| Error::Protocol("bad retransmit length".into()))?;
                request.chunk = Some((offset, size));
            }
            Command::Unsubscribe => {
                // Args are ignored; unsubscribe always covers every device.
            }
            _ => {
                if let Some(list) = args.and_then(Value::as_array) {
                    for item in list {
                        request.targets.push(Target::from_value(item)?);
                    }
                }
            }
        }
        Ok(request)
    }
}

/// Reply-map key for one parameter: `"host:device:parameter"`.
#[must_use]
pub fn reply_key(cns_dev: &str, par: &str) -> String {
    let mut key = String::with_capacity(cns_dev.len() + par.len() + 1);
    key.push_str(cns_dev);
    key.push(NS_DELIMITER);
    key.push_str(par);
    key
}

/// Build the `"ERR.LS"` string reply for a failed command.
#[must_use]
pub fn error_reply(context: &str, err: &Error) -> Value {
    Value::Str(format!("{ERR_PREFIX}. Exception for cmd {context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    #[test]
    fn test_command_wire_names() {
        for name in ["info", "get", "read", "set", "subscribe", "unsubscribe", "retransmit"] {
            let cmd = Command::parse(name).expect("known command should parse");
            assert_eq!(cmd.as_str(), name);
        }
        assert!(Command::parse("monitor").is_err());
    }

    #[test]
    fn test_request_roundtrip_through_wire() {
        let mut target = Target::new("h:dev1", vec!["frequency".to_string()]);
        target.props = vec!["value".to_string()];
        let mut request = Request::new(Command::Get, vec![target]);
        request.username = "op".to_string();
        request.program = "suite".to_string();
        request.pid = 321;

        let wire = encode(&request.to_value());
        let back = Request::from_value(&decode(&wire).expect("decode")).expect("parse");
        assert_eq!(back.command, Command::Get);
        assert_eq!(back.targets.len(), 1);
        assert_eq!(back.targets[0].cns_dev, "h:dev1");
        assert_eq!(back.targets[0].pars, ["frequency"]);
        assert_eq!(back.targets[0].props, ["value"]);
        assert_eq!(back.username, "op");
        assert_eq!(back.pid, 321);
    }

    #[test]
    fn test_retransmit_roundtrip() {
        let request = Request::retransmit(130_000, 65_000);
        let wire = encode(&request.to_value());
        let back = Request::from_value(&decode(&wire).expect("decode")).expect("parse");
        assert_eq!(back.command, Command::Retransmit);
        assert_eq!(back.chunk, Some((130_000, 65_000)));
    }

    #[test]
    fn test_property_alias_v_means_value() {
        let raw = Value::object(vec![(
            "cmd".to_string(),
            Value::Array(vec![
                Value::str("set"),
                Value::Array(vec![Value::Array(vec![
                    Value::str("h:dev1"),
                    Value::Array(vec![
                        Value::Array(vec![Value::str("frequency")]),
                        Value::str("v"),
                        Value::Array(vec![Value::Float(2.0)]),
                    ]),
                ])]),
            ]),
        )]);
        let request = Request::from_value(&raw).expect("parse");
        assert_eq!(request.targets[0].props, ["value"]);
        assert!(request.targets[0].vals.is_some());
    }

    #[test]
    fn test_device_name_extraction() {
        let target = Target::new("host;9700:dev1", vec!["*".to_string()]);
        assert_eq!(target.device_name(), "dev1");
        let target = Target::new("bare", vec![]);
        assert_eq!(target.device_name(), "bare");
    }

    #[test]
    fn test_missing_cmd_key_rejected() {
        let raw = Value::object(vec![("user".to_string(), Value::str("x"))]);
        assert!(matches!(
            Request::from_value(&raw),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_reply_key_shape() {
        assert_eq!(reply_key("h:dev1", "frequency"), "h:dev1:frequency");
    }

    #[test]
    fn test_error_reply_prefix() {
        let v = error_reply("get", &Error::Name("device dev9 not served".into()));
        let s = v.as_str().expect("error reply is a string");
        assert!(s.starts_with(ERR_PREFIX));
        assert!(s.contains("dev9"));
    }
}
