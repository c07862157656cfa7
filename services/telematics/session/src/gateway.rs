//! Ingest pipeline tying detection, decoding and the session registry together

use crate::failure_tracker::DecodeFailureTracker;
use crate::manager::{DeviceSessionManager, SweepReport};
use crate::session::DeviceSession;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use telematics_protocol::{
    DeviceCommand, DeviceMessage, MessageContext, Protocol, ProtocolError, ProtocolRegistry,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Gateway errors surfaced to the transport layer
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No registered protocol claimed the frame
    #[error("no protocol claimed frame from {0}")]
    Unclaimed(String),

    /// Identification succeeded without yielding a device id
    #[error("device id unknown for connection {0}")]
    NoDeviceId(String),

    /// The connection must be closed
    #[error("too many consecutive decode errors on {connection} ({count})")]
    TooManyDecodeErrors {
        /// Connection key
        connection: String,
        /// Device, if known
        device_id: Option<String>,
        /// Length of the failure run
        count: u32,
    },

    /// No live session for the device
    #[error("no session for device {0}")]
    SessionNotFound(String),

    /// Codec failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Session and sweep settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Realm for devices whose context carries none
    pub default_realm: String,
    /// Silence after which a session is removed
    pub session_timeout: Duration,
    /// Silence after which a connected session turns idle
    pub idle_after: Duration,
    /// Consecutive decode failures that close a connection, `0` disables
    pub max_consecutive_decode_errors: u32,
    /// How long the record of a device without a session is kept after its
    /// last contact
    pub connection_retention: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_realm: "master".to_string(),
            session_timeout: Duration::from_secs(300),
            idle_after: Duration::from_secs(60),
            max_consecutive_decode_errors: 5,
            connection_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Result of a handshake attempt
#[derive(Debug, Clone)]
pub struct Identification {
    /// Whether the device was accepted
    pub accepted: bool,
    /// Bytes to send back, if the protocol answers handshakes
    pub response: Option<Bytes>,
    /// Session of the accepted device
    pub session: Option<Arc<DeviceSession>>,
}

/// Outcome of ingesting one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Protocol that claimed the frame
    pub protocol_id: Option<String>,
    /// Messages applied to sessions
    pub decoded: usize,
    /// Records dropped as undecodable
    pub failed: usize,
    /// Bytes acknowledging the decoded messages
    pub acknowledgment: Option<Bytes>,
}

impl IngestReport {
    /// Report for a frame no protocol claimed
    pub fn unclaimed() -> Self {
        Self::default()
    }

    fn claimed(protocol_id: &str) -> Self {
        Self {
            protocol_id: Some(protocol_id.to_string()),
            ..Self::default()
        }
    }

    /// Whether a protocol claimed the frame
    pub fn is_claimed(&self) -> bool {
        self.protocol_id.is_some()
    }
}

/// Entry point for transport workers.
///
/// Cheap to clone; every clone shares the registry, the session manager and
/// the failure tracker.
#[derive(Debug, Clone)]
pub struct Gateway {
    registry: Arc<ProtocolRegistry>,
    manager: Arc<DeviceSessionManager>,
    failures: Arc<DecodeFailureTracker>,
    config: SessionConfig,
}

impl Gateway {
    /// Create a gateway
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        manager: Arc<DeviceSessionManager>,
        config: SessionConfig,
    ) -> Self {
        let failures = Arc::new(DecodeFailureTracker::new(config.max_consecutive_decode_errors));
        Self {
            registry,
            manager,
            failures,
            config,
        }
    }

    /// Protocol registry
    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    /// Session manager
    pub fn manager(&self) -> &Arc<DeviceSessionManager> {
        &self.manager
    }

    /// Settings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Process a handshake frame.
    ///
    /// On acceptance the device's session starts a new connection lifecycle
    /// and is promoted to connected. A rejected device gets no session and the
    /// transport is expected to close the connection.
    pub fn identify(
        &self,
        data: &[u8],
        context: &mut MessageContext,
    ) -> Result<Identification, GatewayError> {
        let protocol = self
            .registry
            .detect(data, context)
            .ok_or_else(|| GatewayError::Unclaimed(context.connection_key()))?;

        let accepted = protocol.handle_identification(data, context);
        let response = protocol.identification_response(accepted, context);
        if !accepted {
            warn!(
                "Identification rejected by {} on {}",
                protocol.protocol_id(),
                context.connection_key()
            );
            return Ok(Identification {
                accepted: false,
                response,
                session: None,
            });
        }

        let device_id = context
            .device_id
            .clone()
            .ok_or_else(|| GatewayError::NoDeviceId(context.connection_key()))?;
        let realm = self.realm_of(context);
        let mut opened = None;
        // A removal may race the lookup; retry once against the fresh session
        for _ in 0..2 {
            let session = self.manager.get_or_create(&device_id, protocol.clone(), &realm);
            if session.begin_connection(context) {
                opened = Some(session);
                break;
            }
        }
        let Some(session) = opened else {
            warn!(
                "Could not open a session for device {} on {}",
                device_id,
                context.connection_key()
            );
            return Ok(Identification {
                accepted: false,
                response: protocol.identification_response(false, context),
                session: None,
            });
        };
        session.on_connect();
        self.failures.clear(&context.connection_key());

        info!(
            "Device {} identified via {} on {}",
            device_id,
            protocol.protocol_id(),
            context.connection_key()
        );
        Ok(Identification {
            accepted: true,
            response,
            session: Some(session),
        })
    }

    /// Decode a frame and apply its messages.
    ///
    /// Every record is decoded against its own derived context, so a malformed
    /// record is dropped without affecting its neighbours. An unbroken run of
    /// failures reaching the configured limit removes the device session and
    /// returns [`GatewayError::TooManyDecodeErrors`].
    pub fn ingest(
        &self,
        data: &[u8],
        context: &mut MessageContext,
    ) -> Result<IngestReport, GatewayError> {
        let Some(protocol) = self.registry.detect(data, context) else {
            return Ok(IngestReport::unclaimed());
        };
        let connection_key = context.connection_key();
        let mut report = IngestReport::claimed(protocol.protocol_id());

        let records = match protocol.split_records(data, context) {
            Ok(records) => records,
            Err(e) => {
                warn!("Dropping frame from {}: {}", connection_key, e);
                report.failed += 1;
                self.record_failure(&connection_key, context)?;
                return Ok(report);
            }
        };
        debug!(
            "Ingesting {} records ({} bytes) from {} via {}",
            records.len(),
            data.len(),
            connection_key,
            protocol.protocol_id()
        );

        for record in records {
            let mut record_context = context.copy_for_new_message();
            match protocol.decode(record, &mut record_context) {
                Ok(messages) => {
                    self.failures.record_success(&connection_key);
                    if context.device_id.is_none() {
                        context.device_id = record_context.device_id.clone();
                    }
                    for message in &messages {
                        if self.apply(&protocol, &record_context, message) {
                            report.decoded += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Dropping record from {}: {}", connection_key, e);
                    report.failed += 1;
                    self.record_failure(&connection_key, context)?;
                }
            }
        }

        report.acknowledgment = protocol.acknowledgment(report.decoded, context);
        Ok(report)
    }

    /// Queue a command for a device
    pub fn send_command(&self, device_id: &str, command: DeviceCommand) -> Result<bool, GatewayError> {
        let session = self
            .manager
            .get(device_id)
            .ok_or_else(|| GatewayError::SessionNotFound(device_id.to_string()))?;
        let queued = session.queue_command(command).map_err(ProtocolError::from)?;
        Ok(queued)
    }

    /// The transport closed the connection behind `context`.
    ///
    /// On connection-oriented transports only the connection that opened the
    /// session's current lifecycle can end it. A late close of a connection
    /// the device already replaced returns `false` and changes nothing.
    pub fn disconnect(&self, context: &MessageContext) -> bool {
        let connection_key = context.connection_key();
        self.failures.clear(&connection_key);
        let Some(device_id) = context.device_id() else {
            return false;
        };

        if context.transport.is_connection_oriented() {
            self.manager.disconnect_connection(device_id, &connection_key)
        } else {
            self.manager.disconnect(device_id)
        }
    }

    /// Run one sweep now
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// Sweep against an explicit clock.
    ///
    /// Also forgets decode failure runs of connections silent for a whole
    /// session timeout.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self.manager.sweep_at(
            self.config.idle_after.as_secs(),
            self.config.session_timeout.as_secs(),
            self.config.connection_retention.as_secs(),
            now,
        );
        self.failures
            .prune_stale_at(self.config.session_timeout.as_secs(), now);
        report
    }

    /// Sweep periodically until the handle is aborted
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Session sweeper started (every {:?})", every);

            loop {
                ticker.tick().await;
                let report = gateway.sweep();
                if report != SweepReport::default() {
                    debug!(
                        "Sweep: {} idle, {} removed, {} records pruned, {} active",
                        report.idled,
                        report.removed,
                        report.pruned,
                        gateway.manager.active_session_count()
                    );
                }
            }
        })
    }

    fn apply(
        &self,
        protocol: &Arc<dyn Protocol>,
        context: &MessageContext,
        message: &DeviceMessage,
    ) -> bool {
        let realm = self.realm_of(context);
        // A removal may race the lookup; retry once against the fresh session
        for _ in 0..2 {
            let session = self
                .manager
                .get_or_create(message.device_id(), protocol.clone(), &realm);
            session.ensure_connection(context);
            if self.manager.on_message(&session, message) {
                return true;
            }
        }
        warn!("Could not apply message for device {}", message.device_id());
        false
    }

    fn record_failure(&self, connection_key: &str, context: &MessageContext) -> Result<(), GatewayError> {
        let (count, exceeded) = self.failures.record_failure(connection_key);
        if !exceeded {
            return Ok(());
        }

        self.failures.clear(connection_key);
        let device_id = context.device_id.clone();
        if let Some(id) = device_id.as_deref() {
            self.manager.remove(id);
        }
        error!(
            "Closing {} (device={}) after {} consecutive decode errors",
            connection_key,
            device_id.as_deref().unwrap_or("-"),
            count
        );
        Err(GatewayError::TooManyDecodeErrors {
            connection: connection_key.to_string(),
            device_id,
            count,
        })
    }

    fn realm_of(&self, context: &MessageContext) -> String {
        context
            .realm
            .clone()
            .unwrap_or_else(|| self.config.default_realm.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, SessionEvent, SessionListener};
    use crate::session::tests::{ReportOnlyProtocol, IMEI};
    use crate::session::SessionState;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{OnceLock, Weak};
    use telematics_protocol::{JsonReportProtocol, Transport};

    fn gateway_with(config: SessionConfig) -> Gateway {
        let mut registry = ProtocolRegistry::new();
        registry
            .register(Arc::new(JsonReportProtocol::default()))
            .unwrap();
        Gateway::new(
            Arc::new(registry),
            Arc::new(DeviceSessionManager::new()),
            config,
        )
    }

    fn gateway() -> Gateway {
        gateway_with(SessionConfig::default())
    }

    fn handshake(device_id: &str) -> Vec<u8> {
        let mut frame = (device_id.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(device_id.as_bytes());
        frame
    }

    fn stream_context() -> MessageContext {
        stream_context_on(5027)
    }

    fn stream_context_on(port: u16) -> MessageContext {
        let addr = SocketAddr::from(([10, 1, 2, 3], port));
        MessageContext::new(Transport::Stream).with_remote_address(addr)
    }

    fn datagram_from(port: u16) -> MessageContext {
        let addr = SocketAddr::from(([10, 9, 9, 9], port));
        MessageContext::new(Transport::Datagram).with_remote_address(addr)
    }

    #[test]
    fn test_stream_identification_connects_session() {
        let gateway = gateway();
        let mut ctx = stream_context();

        let identification = gateway.identify(&handshake(IMEI), &mut ctx).unwrap();
        assert!(identification.accepted);
        assert_eq!(identification.response.as_deref(), Some(&[0x01][..]));
        assert_eq!(ctx.device_id(), Some(IMEI));

        let session = identification.session.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.realm(), "master");
        let conn = gateway.manager().connection(IMEI).unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.connection_count(), 1);
        assert_eq!(conn.transport(), Some(Transport::Stream));
    }

    #[test]
    fn test_rejected_identification_creates_no_session() {
        let gateway = gateway();
        let mut ctx = stream_context();

        let identification = gateway.identify(br#"{"hello":1}"#, &mut ctx).unwrap();
        assert!(!identification.accepted);
        assert_eq!(identification.response.as_deref(), Some(&[0x00][..]));
        assert!(identification.session.is_none());
        assert_eq!(gateway.manager().active_session_count(), 0);
    }

    #[test]
    fn test_malformed_record_is_isolated() {
        let gateway = gateway();
        let mut ctx = stream_context();
        gateway.identify(&handshake(IMEI), &mut ctx).unwrap();

        let packet = b"{\"state\":{\"reported\":{\"sp\":42,\"ts\":1700000000000}}}\n{\"state\":{\"rep";
        let report = gateway.ingest(packet, &mut ctx).unwrap();

        assert_eq!(report.protocol_id.as_deref(), Some("json-report"));
        assert_eq!(report.decoded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.acknowledgment.as_deref(), Some(&[0, 0, 0, 1][..]));

        let session = gateway.manager().get(IMEI).unwrap();
        assert_eq!(session.message_count(), 1);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(gateway.manager().connection(IMEI).unwrap().is_connected());
    }

    #[test]
    fn test_unclaimed_frame_changes_nothing() {
        let gateway = gateway();
        let mut ctx = MessageContext::new(Transport::Datagram);

        let report = gateway.ingest(&[0xde, 0xad, 0xbe, 0xef], &mut ctx).unwrap();
        assert_eq!(report, IngestReport::unclaimed());
        assert!(!report.is_claimed());
        assert_eq!(gateway.manager().active_session_count(), 0);
        assert!(ctx.codec_name.is_none());
    }

    #[test]
    fn test_datagram_first_contact_opens_one_lifecycle() {
        let gateway = gateway();
        let frame = format!(r#"{{"deviceId":"{}","state":{{"reported":{{"io":1}}}}}}"#, IMEI);

        for _ in 0..3 {
            let mut ctx = MessageContext::new(Transport::Datagram);
            let report = gateway.ingest(frame.as_bytes(), &mut ctx).unwrap();
            assert_eq!(report.decoded, 1);
            assert_eq!(ctx.device_id(), Some(IMEI));
        }

        let session = gateway.manager().get(IMEI).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.message_count(), 3);
        let conn = gateway.manager().connection(IMEI).unwrap();
        assert_eq!(conn.connection_count(), 1);
        assert_eq!(conn.transport(), Some(Transport::Datagram));
        assert_eq!(conn.codec_id(), Some("json"));
    }

    #[test]
    fn test_message_after_disconnect_starts_new_lifecycle() {
        let gateway = gateway();
        let mut ctx = MessageContext::new(Transport::PubSub).with_device_id(IMEI);
        gateway
            .ingest(br#"{"state":{"reported":{"sp":1}}}"#, &mut ctx)
            .unwrap();
        assert!(gateway.disconnect(&ctx));
        let session = gateway.manager().get(IMEI).unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);

        gateway
            .ingest(br#"{"state":{"reported":{"sp":2}}}"#, &mut ctx)
            .unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(
            gateway.manager().connection(IMEI).unwrap().connection_count(),
            2
        );
    }

    #[test]
    fn test_consecutive_decode_errors_close_connection() {
        let gateway = gateway_with(SessionConfig {
            max_consecutive_decode_errors: 3,
            ..SessionConfig::default()
        });
        let (listener, mut events) = ChannelListener::new();
        gateway.manager().add_listener(Arc::new(listener));

        let mut ctx = stream_context();
        gateway.identify(&handshake(IMEI), &mut ctx).unwrap();

        // a good record in between resets the run
        let report = gateway.ingest(b"{bad\n{\"RSP\":\"ok\"}\n{bad", &mut ctx).unwrap();
        assert_eq!((report.decoded, report.failed), (1, 2));

        let err = gateway.ingest(b"{bad\n{worse", &mut ctx).unwrap_err();
        match err {
            GatewayError::TooManyDecodeErrors {
                device_id, count, ..
            } => {
                assert_eq!(device_id.as_deref(), Some(IMEI));
                assert_eq!(count, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(gateway.manager().get(IMEI).is_none());

        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            removed |= matches!(event, SessionEvent::Removed { .. });
        }
        assert!(removed);
    }

    #[test]
    fn test_send_command() {
        let gateway = gateway();
        let err = gateway
            .send_command(IMEI, DeviceCommand::get_info())
            .unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound(_)));

        let mut ctx = stream_context();
        gateway.identify(&handshake(IMEI), &mut ctx).unwrap();
        assert!(gateway
            .send_command(IMEI, DeviceCommand::set_digital_output(1, true))
            .unwrap());

        let session = gateway.manager().get(IMEI).unwrap();
        let outbound = session.try_next_command().unwrap();
        assert_eq!(outbound.payload.as_ref(), br#"{"CMD":"setdigout 1 1"}"#);

        gateway.disconnect(&ctx);
        assert!(!gateway
            .send_command(IMEI, DeviceCommand::get_info())
            .unwrap());
    }

    #[test]
    fn test_late_close_after_reconnect_keeps_live_connection() {
        let gateway = gateway();
        let mut old_ctx = stream_context_on(1000);
        gateway.identify(&handshake(IMEI), &mut old_ctx).unwrap();

        let mut live_ctx = stream_context_on(2000);
        gateway.identify(&handshake(IMEI), &mut live_ctx).unwrap();
        assert!(gateway.send_command(IMEI, DeviceCommand::get_info()).unwrap());

        assert!(!gateway.disconnect(&old_ctx));
        let session = gateway.manager().get(IMEI).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.pending_commands(), 1);
        assert!(gateway.manager().connection(IMEI).unwrap().is_connected());
        assert!(gateway.send_command(IMEI, DeviceCommand::get_status()).unwrap());

        assert!(gateway.disconnect(&live_ctx));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!gateway.send_command(IMEI, DeviceCommand::get_info()).unwrap());
    }

    #[test]
    fn test_encode_failure_surfaces_as_protocol_error() {
        let gateway = gateway();
        let protocol = Arc::new(ReportOnlyProtocol { reject: true });
        let session = gateway.manager().get_or_create(IMEI, protocol, "fleet");
        session.begin_connection(&stream_context().with_device_id(IMEI));
        session.on_connect();

        let err = gateway
            .send_command(IMEI, DeviceCommand::get_info())
            .unwrap_err();
        match err {
            GatewayError::Protocol(ProtocolError::Encode(e)) => {
                assert_eq!(e.protocol_id, "report-only");
                assert_eq!(e.command, "getinfo");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(session.pending_commands(), 0);
    }

    /// Removes the first session it sees created
    #[derive(Debug, Default)]
    struct RemoveFirstListener {
        manager: OnceLock<Weak<DeviceSessionManager>>,
        fired: AtomicBool,
    }

    impl SessionListener for RemoveFirstListener {
        fn on_session_created(&self, session: &Arc<DeviceSession>) {
            if self.fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
                manager.remove(session.device_id());
            }
        }

        fn on_session_message(&self, _session: &Arc<DeviceSession>, _message: &DeviceMessage) {}

        fn on_session_removed(&self, _session: &Arc<DeviceSession>) {}
    }

    #[test]
    fn test_identification_retries_after_racing_removal() {
        let gateway = gateway();
        let listener = Arc::new(RemoveFirstListener::default());
        listener
            .manager
            .set(Arc::downgrade(gateway.manager()))
            .unwrap();
        gateway.manager().add_listener(listener.clone());

        let mut ctx = stream_context();
        let identification = gateway.identify(&handshake(IMEI), &mut ctx).unwrap();

        assert!(identification.accepted);
        let session = identification.session.unwrap();
        assert!(!session.is_retired());
        assert_eq!(session.state(), SessionState::Connected);
        let registered = gateway.manager().get(IMEI).unwrap();
        assert!(Arc::ptr_eq(&registered, &session));
        assert_eq!(
            gateway.manager().connection(IMEI).unwrap().connection_count(),
            1
        );
    }

    #[test]
    fn test_disabled_escalation_keeps_no_failure_state() {
        let gateway = gateway_with(SessionConfig {
            max_consecutive_decode_errors: 0,
            ..SessionConfig::default()
        });

        for port in 0..500 {
            let report = gateway.ingest(b"{bad", &mut datagram_from(port)).unwrap();
            assert_eq!(report.failed, 1);
        }
        assert!(gateway.failures.is_empty());
    }

    #[test]
    fn test_sweep_forgets_quiet_failure_runs() {
        let gateway = gateway();
        let mut ctx = datagram_from(7000);
        gateway.ingest(b"{bad", &mut ctx).unwrap();
        assert_eq!(gateway.failures.len(), 1);

        gateway.sweep_at(Utc::now() + chrono::Duration::seconds(30));
        assert_eq!(gateway.failures.len(), 1);

        gateway.sweep_at(Utc::now() + chrono::Duration::seconds(301));
        assert!(gateway.failures.is_empty());
    }

    #[test]
    fn test_sweep_reclaims_records_of_departed_devices() {
        let gateway = gateway_with(SessionConfig {
            connection_retention: Duration::from_secs(600),
            ..SessionConfig::default()
        });

        for n in 0..500 {
            let frame = format!(r#"{{"deviceId":"dev-{}","state":{{"reported":{{"io":1}}}}}}"#, n);
            let mut ctx = MessageContext::new(Transport::Datagram);
            assert_eq!(gateway.ingest(frame.as_bytes(), &mut ctx).unwrap().decoded, 1);
        }
        for n in 0..500 {
            gateway.manager().remove(&format!("dev-{}", n));
        }
        assert_eq!(gateway.manager().active_session_count(), 0);
        assert_eq!(gateway.manager().connections().len(), 500);

        let report = gateway.sweep_at(Utc::now() + chrono::Duration::seconds(601));
        assert_eq!(report.pruned, 500);
        assert!(gateway.manager().connections().is_empty());
    }

    #[test]
    fn test_sweep_uses_configured_windows() {
        let gateway = gateway();
        let mut ctx = stream_context();
        gateway.identify(&handshake(IMEI), &mut ctx).unwrap();

        assert_eq!(gateway.sweep(), SweepReport::default());
        assert_eq!(gateway.manager().active_session_count(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_sessions() {
        let gateway = gateway_with(SessionConfig {
            session_timeout: Duration::ZERO,
            idle_after: Duration::ZERO,
            ..SessionConfig::default()
        });
        let mut ctx = MessageContext::new(Transport::PubSub).with_device_id(IMEI);
        gateway
            .ingest(br#"{"state":{"reported":{"sp":1}}}"#, &mut ctx)
            .unwrap();
        assert_eq!(gateway.manager().active_session_count(), 1);

        let handle = gateway.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(gateway.manager().active_session_count(), 0);
    }
}
