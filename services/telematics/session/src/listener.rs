//! Session lifecycle observers

use crate::session::DeviceSession;
use std::fmt;
use std::sync::Arc;
use telematics_protocol::{DeviceCommand, DeviceMessage};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Observer of session lifecycle events.
///
/// The manager calls these only after releasing every registry lock, so an
/// implementation may call back into the manager.
pub trait SessionListener: Send + Sync + fmt::Debug {
    /// A new session was registered
    fn on_session_created(&self, session: &Arc<DeviceSession>);

    /// A decoded message was applied to a session
    fn on_session_message(&self, session: &Arc<DeviceSession>, message: &DeviceMessage);

    /// A session was removed from the registry
    fn on_session_removed(&self, session: &Arc<DeviceSession>);

    /// The session's current connection closed
    fn on_session_disconnected(&self, _session: &Arc<DeviceSession>) {}

    /// A queued command will never be sent
    fn on_command_failed(&self, _session: &Arc<DeviceSession>, _command: &DeviceCommand) {}
}

/// Event forwarded by [`ChannelListener`]
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session registered
    Created {
        /// Device id
        device_id: String,
        /// Realm
        realm: String,
        /// Bound protocol
        protocol_id: String,
    },
    /// Message applied
    Message {
        /// Device id
        device_id: String,
        /// Decoded message
        message: DeviceMessage,
    },
    /// Connection closed
    Disconnected {
        /// Device id
        device_id: String,
    },
    /// Session removed
    Removed {
        /// Device id
        device_id: String,
        /// Messages the session accepted
        message_count: u64,
    },
    /// Command dropped without being sent
    CommandFailed {
        /// Device id
        device_id: String,
        /// The failed command
        command: DeviceCommand,
    },
}

impl SessionEvent {
    /// Device the event concerns
    pub fn device_id(&self) -> &str {
        match self {
            SessionEvent::Created { device_id, .. }
            | SessionEvent::Message { device_id, .. }
            | SessionEvent::Disconnected { device_id }
            | SessionEvent::Removed { device_id, .. }
            | SessionEvent::CommandFailed { device_id, .. } => device_id,
        }
    }
}

/// Listener forwarding events to a channel for asynchronous consumers
#[derive(Debug, Clone)]
pub struct ChannelListener {
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { event_tx }, event_rx)
    }

    /// Wrap an existing sender
    pub fn from_sender(event_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { event_tx }
    }

    fn send(&self, event: SessionEvent) {
        let device_id = event.device_id().to_string();
        if let Err(e) = self.event_tx.send(event) {
            error!("Failed to forward session event for {}: {}", device_id, e);
        } else {
            debug!("Forwarded session event for {}", device_id);
        }
    }
}

impl SessionListener for ChannelListener {
    fn on_session_created(&self, session: &Arc<DeviceSession>) {
        self.send(SessionEvent::Created {
            device_id: session.device_id().to_string(),
            realm: session.realm().to_string(),
            protocol_id: session.protocol_id().to_string(),
        });
    }

    fn on_session_message(&self, session: &Arc<DeviceSession>, message: &DeviceMessage) {
        self.send(SessionEvent::Message {
            device_id: session.device_id().to_string(),
            message: message.clone(),
        });
    }

    fn on_session_removed(&self, session: &Arc<DeviceSession>) {
        self.send(SessionEvent::Removed {
            device_id: session.device_id().to_string(),
            message_count: session.message_count(),
        });
    }

    fn on_session_disconnected(&self, session: &Arc<DeviceSession>) {
        self.send(SessionEvent::Disconnected {
            device_id: session.device_id().to_string(),
        });
    }

    fn on_command_failed(&self, session: &Arc<DeviceSession>, command: &DeviceCommand) {
        self.send(SessionEvent::CommandFailed {
            device_id: session.device_id().to_string(),
            command: command.clone(),
        });
    }
}
