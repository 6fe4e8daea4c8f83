// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Errors returned by litebus operations.
//!
//! Data-path errors are never fatal to a server: the broker folds them into
//! `"ERR.LS"` reply strings. They become `Error` values again on the client
//! side.

use crate::codec::CodecError;

/// Errors for server, client and codec operations.
#[derive(Debug)]
pub enum Error {
    /// Underlying socket/file I/O failure.
    Io(std::io::Error),
    /// UBJSON encode/decode failure.
    Codec(CodecError),
    /// Malformed request or reply (missing `cmd`, unknown command, bad shape).
    Protocol(String),
    /// Unknown device or parameter, or unresolvable logical name.
    Name(String),
    /// Rejected `set`: out of limits, illegal value, uncoercible type.
    Value(String),
    /// Operation not allowed by the parameter's feature letters.
    Permission(String),
    /// `"ERR.LS"` string received from a remote server.
    Remote(String),
    /// Chunk reassembly gave up (gaps after max retransmits, missing first chunk).
    Delivery(String),
    /// Receive timed out.
    Timeout,
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Codec(e) => write!(f, "codec error: {e}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Name(msg) => write!(f, "name error: {msg}"),
            Error::Value(msg) => write!(f, "value error: {msg}"),
            Error::Permission(msg) => write!(f, "permission error: {msg}"),
            Error::Remote(msg) => write!(f, "server error: {msg}"),
            Error::Delivery(msg) => write!(f, "delivery failed: {msg}"),
            Error::Timeout => write!(f, "receive timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
            Error::Timeout
        } else {
            Error::Io(e)
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_io_errors_collapse_to_timeout() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::WouldBlock, "wb").into();
        assert!(matches!(e, Error::Timeout));
        let e: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "to").into();
        assert!(matches!(e, Error::Timeout));
    }

    #[test]
    fn test_other_io_errors_kept() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy").into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("busy"));
    }
}
