//! Device connections, sessions, outbound command queues and the concurrent
//! session registry for the telematics gateway.
//!
//! This crate owns every piece of shared mutable state in the gateway: the
//! device-id keyed session registry, the durable per-device connection
//! records and the per-device command FIFOs. Transports feed raw frames to the
//! [`Gateway`], which detects the protocol, decodes record by record and
//! applies the resulting messages to sessions.
//!
//! ## Features
//!
//! - **Session registry**: sharded map guaranteeing one session per device id
//! - **Lifecycle**: `Connecting -> Connected -> Idle -> Disconnected`, with
//!   reconnects reusing the durable connection record
//! - **Command path**: FIFO per device, consumed by the connection's send loop
//! - **Failure isolation**: per-record decode errors with escalation after a
//!   run of consecutive failures
//! - **Sweeper**: periodic idle marking and timeout cleanup
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use telematics_protocol::{DeviceCommand, JsonReportProtocol, MessageContext, ProtocolRegistry, Transport};
//! use telematics_session::{DeviceSessionManager, Gateway, SessionConfig, SessionState};
//!
//! let mut registry = ProtocolRegistry::new();
//! registry.register(Arc::new(JsonReportProtocol::default())).unwrap();
//! let gateway = Gateway::new(
//!     Arc::new(registry),
//!     Arc::new(DeviceSessionManager::new()),
//!     SessionConfig::default(),
//! );
//!
//! // length-prefixed device id handshake
//! let mut ctx = MessageContext::new(Transport::Stream);
//! let mut hello = vec![0x00, 0x0F];
//! hello.extend_from_slice(b"356938035643809");
//! let identification = gateway.identify(&hello, &mut ctx).unwrap();
//! assert!(identification.accepted);
//!
//! let report = gateway.ingest(br#"{"state":{"reported":{"sp":42}}}"#, &mut ctx).unwrap();
//! assert_eq!(report.decoded, 1);
//!
//! let session = gateway.manager().get("356938035643809").unwrap();
//! assert_eq!(session.state(), SessionState::Connected);
//! assert!(gateway.send_command("356938035643809", DeviceCommand::get_status()).unwrap());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod failure_tracker;
pub mod gateway;
pub mod listener;
pub mod manager;
pub mod outbound;
pub mod session;

// Re-export main types
pub use connection::{DeviceConnection, SharedConnection};
pub use failure_tracker::DecodeFailureTracker;
pub use gateway::{Gateway, GatewayError, Identification, IngestReport, SessionConfig};
pub use listener::{ChannelListener, SessionEvent, SessionListener};
pub use manager::{DeviceSessionManager, SweepReport};
pub use outbound::{CommandQueue, OutboundCommand};
pub use session::{DeviceSession, SessionState};
