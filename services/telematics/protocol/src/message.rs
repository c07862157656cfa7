//! Vendor-neutral decoded device messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One semantic reading decoded from a device record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeReading {
    /// Attribute name
    pub name: String,
    /// Decoded value
    pub value: serde_json::Value,
    /// Time the device reported the value
    pub timestamp: DateTime<Utc>,
}

impl AttributeReading {
    /// Create a reading
    pub fn new(name: impl Into<String>, value: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }
}

/// Decoded message produced by a protocol for one device
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceMessage {
    device_id: String,
    protocol_id: String,
    received_at: DateTime<Utc>,
    attributes: Vec<AttributeReading>,
}

impl DeviceMessage {
    /// Start building a message
    pub fn builder(device_id: impl Into<String>, protocol_id: impl Into<String>) -> DeviceMessageBuilder {
        DeviceMessageBuilder {
            device_id: device_id.into(),
            protocol_id: protocol_id.into(),
            received_at: None,
            attributes: Vec::new(),
        }
    }

    /// Device the message came from
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Protocol that decoded the message
    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    /// Time the gateway decoded the message
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Readings in decode order
    pub fn attributes(&self) -> &[AttributeReading] {
        &self.attributes
    }

    /// First reading with the given name
    pub fn attribute(&self, name: &str) -> Option<&AttributeReading> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Number of readings
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether the message carries no readings
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Builder for [`DeviceMessage`]
#[derive(Debug)]
pub struct DeviceMessageBuilder {
    device_id: String,
    protocol_id: String,
    received_at: Option<DateTime<Utc>>,
    attributes: Vec<AttributeReading>,
}

impl DeviceMessageBuilder {
    /// Override the received-at time (defaults to now)
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    /// Append a reading
    pub fn attribute(mut self, reading: AttributeReading) -> Self {
        self.attributes.push(reading);
        self
    }

    /// Append several readings
    pub fn attributes(mut self, readings: impl IntoIterator<Item = AttributeReading>) -> Self {
        self.attributes.extend(readings);
        self
    }

    /// Finish the message
    pub fn build(self) -> DeviceMessage {
        DeviceMessage {
            device_id: self.device_id,
            protocol_id: self.protocol_id,
            received_at: self.received_at.unwrap_or_else(Utc::now),
            attributes: self.attributes,
        }
    }
}
