//! Durable per-device runtime record.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use telematics_protocol::Transport;

/// Connection record shared by every session lifecycle of one device
pub type SharedConnection = Arc<Mutex<DeviceConnection>>;

/// Identity, binding and counters of one device across reconnects.
///
/// Pure state: nothing here performs I/O.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConnection {
    vendor_id: String,
    device_id: String,
    asset_id: Option<String>,
    realm: String,
    protocol_id: Option<String>,
    codec_id: Option<String>,
    transport: Option<Transport>,
    connected: bool,
    last_contact: DateTime<Utc>,
    message_count: u64,
    connection_count: u64,
}

impl DeviceConnection {
    /// Create the record the first time a device is seen
    pub fn new(
        vendor_id: impl Into<String>,
        device_id: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            device_id: device_id.into(),
            asset_id: None,
            realm: realm.into(),
            protocol_id: None,
            codec_id: None,
            transport: None,
            connected: false,
            last_contact: Utc::now(),
            message_count: 0,
            connection_count: 0,
        }
    }

    /// Wrap into the shared form used by sessions
    pub fn shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self))
    }

    /// Vendor id
    pub fn vendor_id(&self) -> &str {
        &self.vendor_id
    }

    /// Device id
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Asset the device resolved to, set externally
    pub fn asset_id(&self) -> Option<&str> {
        self.asset_id.as_deref()
    }

    /// Set the resolved asset id
    pub fn set_asset_id(&mut self, asset_id: Option<String>) {
        self.asset_id = asset_id;
    }

    /// Realm
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Protocol bound to the device
    pub fn protocol_id(&self) -> Option<&str> {
        self.protocol_id.as_deref()
    }

    /// Bind a protocol
    pub fn set_protocol_id(&mut self, protocol_id: Option<String>) {
        self.protocol_id = protocol_id;
    }

    /// Codec last used for the device
    pub fn codec_id(&self) -> Option<&str> {
        self.codec_id.as_deref()
    }

    /// Record the codec
    pub fn set_codec_id(&mut self, codec_id: Option<String>) {
        self.codec_id = codec_id;
    }

    /// Transport of the latest connection
    pub fn transport(&self) -> Option<Transport> {
        self.transport
    }

    /// Record the transport
    pub fn set_transport(&mut self, transport: Option<Transport>) {
        self.transport = transport;
    }

    /// Whether a physical connection is currently open
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Flip the connectivity flag
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Time of the last contact
    pub fn last_contact(&self) -> DateTime<Utc> {
        self.last_contact
    }

    /// Decoded messages over the device lifetime
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Physical connections over the device lifetime
    pub fn connection_count(&self) -> u64 {
        self.connection_count
    }

    /// Record contact now
    pub fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    /// Record contact at `at`; never moves the timestamp backwards
    pub fn touch_at(&mut self, at: DateTime<Utc>) {
        if at > self.last_contact {
            self.last_contact = at;
        }
    }

    /// Count one decoded message
    pub fn increment_message_count(&mut self) {
        self.message_count = self.message_count.saturating_add(1);
    }

    /// Count one physical connection
    pub fn increment_connection_count(&mut self) {
        self.connection_count = self.connection_count.saturating_add(1);
    }
}
