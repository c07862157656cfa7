//! Protocol contract, message context, commands and codec detection for the
//! telematics gateway.
//!
//! This crate defines what a vendor codec must provide and the vendor-neutral
//! types that flow between codecs, the session layer and the transports.
//!
//! ## Features
//!
//! - **Protocol trait**: detection, decode, command encoding, acknowledgment
//!   and handshake hooks with no-op defaults
//! - **Detection**: ordered registry probing with per-connection codec caching
//! - **Message context**: per-connection metadata with per-record derivation
//! - **Reference codec**: newline-delimited JSON reports
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use telematics_protocol::{JsonReportProtocol, MessageContext, ProtocolRegistry, Transport};
//!
//! let mut registry = ProtocolRegistry::new();
//! registry.register(Arc::new(JsonReportProtocol::default())).unwrap();
//!
//! let mut ctx = MessageContext::new(Transport::PubSub).with_device_id("356938035643809");
//! let frame = br#"{"state":{"reported":{"sp":42}}}"#;
//! let protocol = registry.detect(frame, &mut ctx).expect("claimed");
//! let messages = protocol.decode(frame, &mut ctx.copy_for_new_message()).unwrap();
//! assert_eq!(messages.len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod context;
pub mod error;
pub mod json;
pub mod message;
pub mod protocol;
pub mod registry;

// Re-export main types
pub use command::DeviceCommand;
pub use context::{MessageContext, Transport};
pub use error::{CommandError, DecodeError, EncodeError, ProtocolError, RegistryError};
pub use json::{JsonReportProtocol, CODEC_JSON, JSON_REPORT_PROTOCOL_ID, RESPONSE_ATTRIBUTE};
pub use message::{AttributeReading, DeviceMessage, DeviceMessageBuilder};
pub use protocol::Protocol;
pub use registry::ProtocolRegistry;
