//! Protocol error types.

use thiserror::Error;

/// A frame or record could not be decoded.
///
/// Carries the protocol and device ids when they are known so the failure can
/// be correlated in logs. Decode errors are scoped to a single record: the
/// caller drops that record and keeps the connection open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("decode failed (protocol={}, device={}): {reason}", display_opt(.protocol_id), display_opt(.device_id))]
pub struct DecodeError {
    /// Protocol that rejected the data
    pub protocol_id: Option<String>,
    /// Device the data belonged to, if known
    pub device_id: Option<String>,
    /// Human readable reason
    pub reason: String,
}

impl DecodeError {
    /// Create a decode error attributed to a protocol
    pub fn new(protocol_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            protocol_id: Some(protocol_id.into()),
            device_id: None,
            reason: reason.into(),
        }
    }

    /// Attach the device id
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Attach the device id only when one is known
    pub fn with_device_opt(mut self, device_id: Option<&str>) -> Self {
        if let Some(id) = device_id {
            self.device_id = Some(id.to_string());
        }
        self
    }
}

/// A command could not be translated into wire bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("encode of command '{command}' failed for protocol {protocol_id}: {reason}")]
pub struct EncodeError {
    /// Protocol asked to encode
    pub protocol_id: String,
    /// Literal command text
    pub command: String,
    /// Human readable reason
    pub reason: String,
}

impl EncodeError {
    /// Create an encode error
    pub fn new(
        protocol_id: impl Into<String>,
        command: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Invalid command text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Command text was empty after normalization
    #[error("command text is empty")]
    Empty,
}

/// Protocol registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A protocol with the same id is already registered
    #[error("protocol already registered: {0}")]
    Duplicate(String),
    /// Priority list names a protocol that is not registered
    #[error("unknown protocol in priority list: {0}")]
    Unknown(String),
}

/// Any error raised by a protocol call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode failure
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// Encode failure
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

fn display_opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}
