//! Logical per-device session and its lifecycle state machine

use crate::connection::{DeviceConnection, SharedConnection};
use crate::outbound::{CommandQueue, OutboundCommand};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use telematics_protocol::{
    DeviceCommand, DeviceMessage, EncodeError, MessageContext, Protocol, Transport,
};
use tracing::{debug, info};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Created, handshake not yet completed
    Connecting = 0,
    /// Handshake done or first message accepted
    Connected = 1,
    /// No contact for the idle window, still logically alive
    Idle = 2,
    /// Terminal for the current connection instance
    Disconnected = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Connected,
            2 => SessionState::Idle,
            _ => SessionState::Disconnected,
        }
    }

    /// Lowercase name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Idle => "idle",
            SessionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device-id keyed lifecycle object.
///
/// A session outlives individual physical connections: a reconnect starts a
/// new lifecycle on the same object through [`DeviceSession::begin_connection`].
/// Each lifecycle remembers the key of the connection that opened it, so a
/// late close of an older connection cannot end a newer one. Once the manager
/// removes it the session is retired and refuses further messages and
/// commands.
#[derive(Debug)]
pub struct DeviceSession {
    device_id: String,
    realm: String,
    protocol: Arc<dyn Protocol>,
    connection: SharedConnection,
    state: AtomicU8,
    created_at: DateTime<Utc>,
    last_seen_ms: AtomicI64,
    message_count: AtomicU64,
    /// Connection key of the open lifecycle
    lifecycle: Mutex<Option<String>>,
    retired: AtomicBool,
    commands: CommandQueue,
}

impl DeviceSession {
    /// Create a session in `Connecting` state
    pub fn new(
        device_id: impl Into<String>,
        realm: impl Into<String>,
        protocol: Arc<dyn Protocol>,
        connection: SharedConnection,
    ) -> Self {
        let created_at = Utc::now();
        {
            let mut conn = connection.lock();
            conn.set_protocol_id(Some(protocol.protocol_id().to_string()));
        }

        Self {
            device_id: device_id.into(),
            realm: realm.into(),
            protocol,
            connection,
            state: AtomicU8::new(SessionState::Connecting as u8),
            created_at,
            last_seen_ms: AtomicI64::new(created_at.timestamp_millis()),
            message_count: AtomicU64::new(0),
            lifecycle: Mutex::new(None),
            retired: AtomicBool::new(false),
            commands: CommandQueue::new(),
        }
    }

    /// Device id
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Realm
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Bound protocol
    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    /// Id of the bound protocol
    pub fn protocol_id(&self) -> &str {
        self.protocol.protocol_id()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last contact
    pub fn last_seen(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_seen_ms.load(Ordering::SeqCst))
            .single()
            .unwrap_or(self.created_at)
    }

    /// Messages accepted by this session
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    /// Shared connection record
    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    /// Point-in-time copy of the connection record
    pub fn connection_snapshot(&self) -> DeviceConnection {
        self.connection.lock().clone()
    }

    /// Asset the device resolved to
    pub fn asset_id(&self) -> Option<String> {
        self.connection.lock().asset_id().map(str::to_string)
    }

    /// Set by the external identity resolver
    pub fn set_asset_id(&self, asset_id: Option<String>) {
        self.connection.lock().set_asset_id(asset_id);
    }

    /// Whether the manager has removed this session
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Whether a connection lifecycle is currently open
    pub fn has_open_connection(&self) -> bool {
        self.lifecycle.lock().is_some()
    }

    /// Key of the connection that opened the current lifecycle
    pub fn connection_key(&self) -> Option<String> {
        self.lifecycle.lock().clone()
    }

    /// Start a new connection lifecycle for the connection behind `context`.
    ///
    /// Replaces any lifecycle still open. Returns `false` on a retired session.
    pub fn begin_connection(&self, context: &MessageContext) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if self.is_retired() {
            return false;
        }
        if let Some(previous) = lifecycle.as_deref() {
            debug!(
                "Device {} replaces connection {} with {}",
                self.device_id,
                previous,
                context.connection_key()
            );
        }
        self.open_lifecycle(&mut lifecycle, context);
        true
    }

    /// Start a lifecycle only if none is open. Returns whether one was started.
    ///
    /// Used for transports without connect events, where the first accepted
    /// message opens the lifecycle.
    pub fn ensure_connection(&self, context: &MessageContext) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if self.is_retired() || lifecycle.is_some() {
            return false;
        }
        self.open_lifecycle(&mut lifecycle, context);
        true
    }

    fn open_lifecycle(&self, lifecycle: &mut Option<String>, context: &MessageContext) {
        *lifecycle = Some(context.connection_key());
        self.state
            .store(SessionState::Connecting as u8, Ordering::SeqCst);
        self.commands.reopen();
        let now = Utc::now();
        self.touch_at(now);

        let mut conn = self.connection.lock();
        conn.increment_connection_count();
        conn.set_transport(Some(context.transport));
        conn.set_codec_id(context.codec_name.clone());
        conn.set_protocol_id(Some(self.protocol.protocol_id().to_string()));
        conn.set_connected(true);
        conn.touch_at(now);
        debug!(
            "Device {} opened connection #{} over {}",
            self.device_id,
            conn.connection_count(),
            context.transport
        );
    }

    /// Apply an accepted message. `false` on a retired session.
    pub fn on_message(&self, message: &DeviceMessage) -> bool {
        if self.is_retired() {
            return false;
        }

        let now = Utc::now();
        self.touch_at(now);
        self.message_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut conn = self.connection.lock();
            conn.touch_at(now);
            conn.increment_message_count();
        }

        let previous = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
            match SessionState::from_u8(raw) {
                SessionState::Connecting | SessionState::Idle => {
                    Some(SessionState::Connected as u8)
                }
                _ => None,
            }
        });
        if let Ok(raw) = previous {
            debug!(
                "Device {} {} -> connected on message with {} readings",
                self.device_id,
                SessionState::from_u8(raw),
                message.len()
            );
        }
        true
    }

    /// Handshake completed on the current connection
    pub fn on_connect(&self) {
        if self.is_retired() {
            return;
        }
        let now = Utc::now();
        self.state
            .store(SessionState::Connected as u8, Ordering::SeqCst);
        self.touch_at(now);

        let mut conn = self.connection.lock();
        conn.set_connected(true);
        conn.touch_at(now);
        info!("Device {} connected (realm={})", self.device_id, self.realm);
    }

    /// Close the current connection lifecycle.
    ///
    /// Returns the commands that were still queued; the caller must fail them.
    pub fn on_disconnect(&self) -> Vec<DeviceCommand> {
        let mut lifecycle = self.lifecycle.lock();
        self.close_lifecycle(&mut lifecycle)
    }

    /// Close the lifecycle only if `connection_key` opened it.
    ///
    /// `None` when another connection owns the session, which happens when a
    /// device reconnects before its old connection is noticed closed.
    pub fn on_disconnect_from(&self, connection_key: &str) -> Option<Vec<DeviceCommand>> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.as_deref() != Some(connection_key) {
            return None;
        }
        Some(self.close_lifecycle(&mut lifecycle))
    }

    fn close_lifecycle(&self, lifecycle: &mut Option<String>) -> Vec<DeviceCommand> {
        *lifecycle = None;
        self.state
            .store(SessionState::Disconnected as u8, Ordering::SeqCst);
        self.connection.lock().set_connected(false);

        let failed: Vec<DeviceCommand> = self
            .commands
            .close()
            .into_iter()
            .map(|outbound| outbound.command)
            .collect();
        info!(
            "Device {} disconnected ({} queued commands failed)",
            self.device_id,
            failed.len()
        );
        failed
    }

    /// Encode and enqueue a command.
    ///
    /// `Ok(false)` when the session cannot send (disconnected or removed),
    /// `Err` when the protocol cannot encode it. Nothing is queued in either case.
    pub fn queue_command(&self, command: DeviceCommand) -> Result<bool, EncodeError> {
        if self.is_retired() || self.state() == SessionState::Disconnected {
            debug!(
                "Refusing command '{}' for device {} in state {}",
                command,
                self.device_id,
                self.state()
            );
            return Ok(false);
        }

        let context = self.command_context();
        let payload = self
            .protocol
            .encode_command(&command, &context)?
            .ok_or_else(|| {
                EncodeError::new(
                    self.protocol.protocol_id(),
                    command.as_str(),
                    "protocol does not support outbound commands",
                )
            })?;

        let queued = self.commands.push(OutboundCommand::new(command, payload));
        if queued {
            debug!(
                "Queued command for device {} ({} pending)",
                self.device_id,
                self.commands.len()
            );
        }
        Ok(queued)
    }

    /// Wait for the next command to send. `None` once the session disconnects.
    pub async fn next_command(&self) -> Option<OutboundCommand> {
        self.commands.next().await
    }

    /// Take the next command without waiting
    pub fn try_next_command(&self) -> Option<OutboundCommand> {
        self.commands.try_pop()
    }

    /// Number of commands waiting to be sent
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Whether no contact happened for more than `timeout_secs`
    pub fn is_timed_out(&self, timeout_secs: u64) -> bool {
        self.is_timed_out_at(timeout_secs, Utc::now())
    }

    /// Timeout check against an explicit clock
    pub fn is_timed_out_at(&self, timeout_secs: u64, now: DateTime<Utc>) -> bool {
        let timeout_ms = i64::try_from(timeout_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        self.last_seen_ms
            .load(Ordering::SeqCst)
            .saturating_add(timeout_ms)
            < now.timestamp_millis()
    }

    /// Move `Connected -> Idle` after `idle_secs` without contact
    pub fn mark_idle_at(&self, idle_secs: u64, now: DateTime<Utc>) -> bool {
        if !self.is_timed_out_at(idle_secs, now) {
            return false;
        }
        let changed = self
            .state
            .compare_exchange(
                SessionState::Connected as u8,
                SessionState::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if changed {
            debug!("Device {} is idle", self.device_id);
        }
        changed
    }

    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn touch_at(&self, at: DateTime<Utc>) {
        self.last_seen_ms
            .fetch_max(at.timestamp_millis(), Ordering::SeqCst);
    }

    fn command_context(&self) -> MessageContext {
        let conn = self.connection.lock();
        let mut context = MessageContext::new(conn.transport().unwrap_or(Transport::Stream))
            .with_device_id(self.device_id.clone())
            .with_realm(self.realm.clone());
        context.codec_name = conn.codec_id().map(str::to_string);
        context
    }
}
