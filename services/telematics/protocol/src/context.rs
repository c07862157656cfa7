//! Per-connection and per-message metadata handed to every protocol call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Transport a frame arrived on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Persistent stream connection (TCP, TLS)
    Stream,
    /// Connectionless datagrams (UDP)
    Datagram,
    /// Publish/subscribe messaging (MQTT)
    PubSub,
    /// Request/response exchange (HTTP)
    RequestResponse,
}

impl Transport {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Stream => "stream",
            Transport::Datagram => "datagram",
            Transport::PubSub => "pubsub",
            Transport::RequestResponse => "request_response",
        }
    }

    /// Whether the transport has explicit connect and disconnect events
    pub fn is_connection_oriented(&self) -> bool {
        matches!(self, Transport::Stream)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(Transport::Stream),
            "datagram" | "udp" => Ok(Transport::Datagram),
            "pubsub" | "mqtt" => Ok(Transport::PubSub),
            "request_response" | "http" => Ok(Transport::RequestResponse),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// Mutable metadata bag for one connection or one logical message.
///
/// The transport layer creates one context per connection. The device id is
/// filled in once identification succeeds and the winning protocol id is
/// cached in `codec_name` so later frames skip detection.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageContext {
    /// Device id once known
    pub device_id: Option<String>,
    /// Transport kind
    pub transport: Transport,
    /// Remote peer address, if the transport exposes one
    pub remote_address: Option<SocketAddr>,
    /// Realm (tenant) the device belongs to
    pub realm: Option<String>,
    /// Codec or protocol currently handling the data
    pub codec_name: Option<String>,
    /// Packet sequence id, protocol specific
    pub packet_id: u64,
    /// Free-form scratch attributes
    pub attributes: HashMap<String, serde_json::Value>,
}

impl MessageContext {
    /// Create an empty context for a transport
    pub fn new(transport: Transport) -> Self {
        Self {
            device_id: None,
            transport,
            remote_address: None,
            realm: None,
            codec_name: None,
            packet_id: 0,
            attributes: HashMap::new(),
        }
    }

    /// Set the device id
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Set the remote address
    pub fn with_remote_address(mut self, addr: SocketAddr) -> Self {
        self.remote_address = Some(addr);
        self
    }

    /// Set the realm
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// Device id as a string slice
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Fresh context for the next logical record of the same connection.
    ///
    /// Keeps device id, transport, remote address and realm. Clears packet id,
    /// codec name and scratch attributes.
    pub fn copy_for_new_message(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            transport: self.transport,
            remote_address: self.remote_address,
            realm: self.realm.clone(),
            codec_name: None,
            packet_id: 0,
            attributes: HashMap::new(),
        }
    }

    /// Key identifying the physical connection behind this context
    pub fn connection_key(&self) -> String {
        match (&self.remote_address, &self.device_id) {
            (Some(addr), _) => format!("{}://{}", self.transport, addr),
            (None, Some(device)) => format!("{}:device:{}", self.transport, device),
            (None, None) => format!("{}:anonymous", self.transport),
        }
    }

    /// Insert a scratch attribute
    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Read a scratch attribute
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }
}
