use std::fmt;

use thiserror::Error;

/// A malformed or foreign frame.
///
/// Decode errors never end a session: the offending datagram is dropped
/// and reception continues.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unable to decode frame: {reason}")]
pub struct DecodeError {
    /// Human readable reason.
    pub reason: String,
}

impl DecodeError {
    pub(crate) fn new<S: Into<String>>(reason: S) -> DecodeError {
        DecodeError {
            reason: reason.into(),
        }
    }
}

/// The kind of a `TransportError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Binding or configuring the local socket failed.
    Bind,
    /// Sending a datagram failed.
    Send,
    /// Receiving a datagram failed.
    Receive,
    /// No remote endpoint has been selected yet.
    NoEndpoint,
    /// The requested device id is not among the discovery results.
    UnknownDevice,
    /// An address could not be parsed or resolved.
    Address,
}

impl TransportErrorKind {
    /// The snake_case name used in report codes.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::Bind => "bind",
            TransportErrorKind::Send => "send",
            TransportErrorKind::Receive => "receive",
            TransportErrorKind::NoEndpoint => "no_endpoint",
            TransportErrorKind::UnknownDevice => "unknown_device",
            TransportErrorKind::Address => "address",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A socket level failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("transport error ({kind}): {detail}")]
pub struct TransportError {
    /// What the transport was doing.
    pub kind: TransportErrorKind,
    /// Details, usually the underlying I/O error message.
    pub detail: String,
}

impl TransportError {
    pub(crate) fn new<S: Into<String>>(kind: TransportErrorKind, detail: S) -> TransportError {
        TransportError {
            kind,
            detail: detail.into(),
        }
    }

    pub(crate) fn io(kind: TransportErrorKind, err: &std::io::Error) -> TransportError {
        TransportError::new(kind, err.to_string())
    }
}

/// A common error type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// See `DecodeError`.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// See `TransportError`.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Discovery finished without finding any device.
    #[error("no devices discovered")]
    NoDevicesDiscovered,

    /// The requested device id did not show up during discovery.
    #[error("device {0:?} not discovered")]
    DeviceNotDiscovered(String),

    /// The device answered the connect request with a rejection.
    #[error("connection rejected: {0}")]
    ConnectRejected(String),

    /// The device did not acknowledge the connect request in time.
    #[error("timed out waiting for connection")]
    ConnectTimeout,

    /// Connected, but no data frame arrived in time.
    #[error("connected but no data received")]
    DataTimeout,

    /// The session ended with the given code while waiting for data.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// A key name that is not part of the catalogs.
    #[error("unknown key {0:?}")]
    UnknownKey(String),

    /// The device does not report the setpoint.
    #[error("setpoint {0:?} not supported by device")]
    UnsupportedKey(String),

    /// The requested value lies outside the device reported bounds.
    #[error("value {value} outside allowed range [{min}..{max}]")]
    OutOfRange {
        /// The requested value.
        value: f64,
        /// Device reported minimum.
        min: f64,
        /// Device reported maximum.
        max: f64,
    },

    /// The requested value has no exact representation at the key's resolution.
    #[error("value {value} is not a multiple of {resolution}")]
    NotRepresentable {
        /// The requested value.
        value: f64,
        /// The smallest step the key can carry on the wire.
        resolution: f64,
    },

    /// The value read back after a write differs from the requested one.
    #[error("readback {observed:?} does not match requested {requested}")]
    ReadbackMismatch {
        /// The requested value.
        requested: f64,
        /// The value read back, if any.
        observed: Option<f64>,
    },

    /// An operation was issued in a session phase that does not allow it.
    #[error("operation {operation} not allowed while {phase}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The session phase at that time.
        phase: String,
    },

    /// A service call named a target that is not configured.
    #[error("no such target {0:?}")]
    NoSuchTarget(String),

    /// A polling refresh did not produce a usable report.
    #[error("update failed: {0}")]
    UpdateFailed(String),

    /// A setpoint write use-case did not succeed.
    #[error("setpoint write failed for {key}: {code}")]
    SetpointFailed {
        /// The setpoint key.
        key: String,
        /// The report's connection error code.
        code: String,
    },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The stable code used in reports' `connection_error` field.
    pub fn code(&self) -> String {
        match self {
            Error::Decode(_) => "decode_error".into(),
            Error::Transport(err) => format!("transport_{}", err.kind),
            Error::NoDevicesDiscovered => "no_devices_discovered".into(),
            Error::DeviceNotDiscovered(_) => "device_not_discovered".into(),
            Error::ConnectRejected(code) => code.clone(),
            Error::ConnectTimeout => "connect_timeout".into(),
            Error::DataTimeout => "connected_but_no_data".into(),
            Error::SessionFailed(code) => code.clone(),
            Error::UnknownKey(_) => "unknown_key".into(),
            Error::UnsupportedKey(_) => "setpoint_not_supported".into(),
            Error::OutOfRange { .. } => "setpoint_out_of_range".into(),
            Error::NotRepresentable { .. } => "setpoint_not_representable".into(),
            Error::ReadbackMismatch { .. } => "setpoint_readback_mismatch".into(),
            Error::InvalidState { .. } => "invalid_state".into(),
            Error::NoSuchTarget(_) => "no_such_target".into(),
            Error::UpdateFailed(code) => code.clone(),
            Error::SetpointFailed { code, .. } => code.clone(),
            Error::Config(_) => "config_error".into(),
        }
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Error {
        Error::Transport(TransportError::new(
            TransportErrorKind::Address,
            err.to_string(),
        ))
    }
}

/// A common result type.
pub type Result<T> = std::result::Result<T, Error>;
