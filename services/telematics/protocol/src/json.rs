//! JSON report codec.
//!
//! Devices publish newline-delimited JSON records. Two record shapes are
//! understood:
//!
//! ```text
//! {"state":{"reported":{"ts":1718000000000,"latlng":"54.1,25.3","sp":42}}}
//! {"RSP":"DOUT1:1 DOUT2:0"}
//! ```
//!
//! Stream connections identify themselves first with a handshake frame made of
//! a big-endian `u16` length followed by that many ASCII alphanumeric id bytes.
//! The gateway answers `0x01` (accepted) or `0x00` (rejected).

use crate::command::DeviceCommand;
use crate::context::{MessageContext, Transport};
use crate::error::{DecodeError, EncodeError};
use crate::message::{AttributeReading, DeviceMessage};
use crate::protocol::Protocol;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Default protocol id
pub const JSON_REPORT_PROTOCOL_ID: &str = "json-report";
/// Codec name recorded on decoded records
pub const CODEC_JSON: &str = "json";
/// Name of the reading produced for command responses
pub const RESPONSE_ATTRIBUTE: &str = "response";

const TIMESTAMP_KEY: &str = "ts";
const DEVICE_ID_KEY: &str = "deviceId";
const MAX_DEVICE_ID_LEN: usize = 64;

/// Newline-delimited JSON report protocol
#[derive(Debug, Clone)]
pub struct JsonReportProtocol {
    protocol_id: String,
    vendor_id: String,
    vendor_name: String,
    transports: Vec<Transport>,
}

impl JsonReportProtocol {
    /// Create a protocol instance accepting the given transports
    pub fn new(
        protocol_id: impl Into<String>,
        vendor_id: impl Into<String>,
        vendor_name: impl Into<String>,
        transports: Vec<Transport>,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            vendor_id: vendor_id.into(),
            vendor_name: vendor_name.into(),
            transports,
        }
    }

    /// Same codec restricted to other transports
    pub fn with_transports(mut self, transports: Vec<Transport>) -> Self {
        self.transports = transports;
        self
    }

    /// Transports this instance claims
    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }

    fn decode_error(&self, context: &MessageContext, reason: impl Into<String>) -> DecodeError {
        DecodeError::new(&self.protocol_id, reason).with_device_opt(context.device_id())
    }

    fn readings(
        &self,
        root: &Map<String, Value>,
        context: &MessageContext,
    ) -> Result<Vec<AttributeReading>, DecodeError> {
        if let Some(reported) = root
            .get("state")
            .and_then(|s| s.get("reported"))
            .and_then(Value::as_object)
        {
            let timestamp = match reported.get(TIMESTAMP_KEY) {
                Some(raw) => parse_timestamp(raw)
                    .ok_or_else(|| self.decode_error(context, format!("invalid timestamp: {}", raw)))?,
                None => Utc::now(),
            };

            let readings: Vec<AttributeReading> = reported
                .iter()
                .filter(|(name, _)| name.as_str() != TIMESTAMP_KEY)
                .map(|(name, value)| AttributeReading::new(name.clone(), value.clone(), timestamp))
                .collect();

            if readings.is_empty() {
                return Err(self.decode_error(context, "payload does not contain decodable values"));
            }
            return Ok(readings);
        }

        let rsp = match root.get("RSP") {
            Some(Value::Null) | None => {
                return Err(self.decode_error(
                    context,
                    "unsupported JSON structure: expected state.reported or RSP",
                ))
            }
            Some(rsp) => rsp,
        };

        let response = match rsp {
            Value::Object(inner) => inner.get("RSP").and_then(Value::as_str),
            other => other.as_str(),
        }
        .ok_or_else(|| self.decode_error(context, "RSP payload is missing string value"))?;

        Ok(vec![AttributeReading::new(
            RESPONSE_ATTRIBUTE,
            Value::String(response.to_string()),
            Utc::now(),
        )])
    }
}

impl Default for JsonReportProtocol {
    fn default() -> Self {
        Self::new(
            JSON_REPORT_PROTOCOL_ID,
            "generic",
            "Generic JSON Telematics",
            vec![Transport::Stream, Transport::Datagram, Transport::PubSub],
        )
    }
}

impl Protocol for JsonReportProtocol {
    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn vendor_id(&self) -> &str {
        &self.vendor_id
    }

    fn vendor_name(&self) -> &str {
        &self.vendor_name
    }

    fn can_handle(&self, data: &[u8], context: &MessageContext) -> bool {
        if !self.transports.contains(&context.transport) {
            return false;
        }
        trim_ascii(data).first() == Some(&b'{') || parse_identification(data).is_some()
    }

    fn split_records<'a>(
        &self,
        data: &'a [u8],
        _context: &MessageContext,
    ) -> Result<Vec<&'a [u8]>, DecodeError> {
        Ok(data
            .split(|b| *b == b'\n')
            .map(trim_ascii)
            .filter(|record| !record.is_empty())
            .collect())
    }

    fn decode(
        &self,
        data: &[u8],
        context: &mut MessageContext,
    ) -> Result<Vec<DeviceMessage>, DecodeError> {
        let root: Value = serde_json::from_slice(data)
            .map_err(|e| self.decode_error(context, format!("invalid JSON payload: {}", e)))?;
        let root = root
            .as_object()
            .ok_or_else(|| self.decode_error(context, "JSON payload is not an object"))?;

        let device_id = match context.device_id.clone() {
            Some(id) => id,
            None => root
                .get(DEVICE_ID_KEY)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| self.decode_error(context, "device id is required for decode"))?,
        };
        context.device_id = Some(device_id.clone());

        let readings = self.readings(root, context)?;
        context.codec_name = Some(CODEC_JSON.to_string());

        Ok(vec![DeviceMessage::builder(device_id, &self.protocol_id)
            .attributes(readings)
            .build()])
    }

    fn encode_command(
        &self,
        command: &DeviceCommand,
        _context: &MessageContext,
    ) -> Result<Option<Bytes>, EncodeError> {
        let payload = serde_json::json!({ "CMD": command.as_str() });
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| EncodeError::new(&self.protocol_id, command.as_str(), e.to_string()))?;
        Ok(Some(Bytes::from(bytes)))
    }

    fn acknowledgment(&self, message_count: usize, _context: &MessageContext) -> Option<Bytes> {
        if message_count == 0 {
            return None;
        }
        let count = u32::try_from(message_count).unwrap_or(u32::MAX);
        Some(Bytes::copy_from_slice(&count.to_be_bytes()))
    }

    fn handle_identification(&self, data: &[u8], context: &mut MessageContext) -> bool {
        match parse_identification(data) {
            Some(device_id) => {
                context.device_id = Some(device_id);
                true
            }
            None => false,
        }
    }

    fn identification_response(&self, accepted: bool, _context: &MessageContext) -> Option<Bytes> {
        Some(Bytes::from_static(if accepted { b"\x01" } else { b"\x00" }))
    }
}

/// Length-prefixed ASCII device id, or `None` when `data` is not a handshake
fn parse_identification(data: &[u8]) -> Option<String> {
    if data.len() < 3 {
        return None;
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let id = &data[2..];
    if len != id.len() || len > MAX_DEVICE_ID_LEN || !id.iter().all(u8::is_ascii_alphanumeric) {
        return None;
    }
    std::str::from_utf8(id).ok().map(str::to_string)
}

fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    let millis = match raw {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

fn trim_ascii(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const IMEI: &str = "356938035643809";

    fn handshake(id: &str) -> Vec<u8> {
        let mut frame = (id.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(id.as_bytes());
        frame
    }

    fn stream_ctx() -> MessageContext {
        MessageContext::new(Transport::Stream)
    }

    #[test]
    fn test_identification_sets_device_id() {
        let protocol = JsonReportProtocol::default();
        let mut ctx = stream_ctx();
        let frame = handshake(IMEI);

        assert!(protocol.can_handle(&frame, &ctx));
        assert!(protocol.handle_identification(&frame, &mut ctx));
        assert_eq!(ctx.device_id(), Some(IMEI));
        assert_eq!(
            protocol.identification_response(true, &ctx).unwrap().as_ref(),
            &[0x01]
        );
        assert_eq!(
            protocol.identification_response(false, &ctx).unwrap().as_ref(),
            &[0x00]
        );
    }

    #[test]
    fn test_identification_rejects_bad_length() {
        let protocol = JsonReportProtocol::default();
        let mut ctx = stream_ctx();
        let mut frame = handshake(IMEI);
        frame.push(b'9');

        assert!(!protocol.handle_identification(&frame, &mut ctx));
        assert!(ctx.device_id.is_none());
    }

    #[test]
    fn test_can_handle_respects_transport() {
        let protocol = JsonReportProtocol::default().with_transports(vec![Transport::PubSub]);
        let data = br#"{"RSP":"ok"}"#;
        assert!(protocol.can_handle(data, &MessageContext::new(Transport::PubSub)));
        assert!(!protocol.can_handle(data, &MessageContext::new(Transport::Stream)));
        assert!(!protocol.can_handle(b"\x00\x0f\x08", &MessageContext::new(Transport::PubSub)));
    }

    #[test]
    fn test_decode_reported_state() {
        let protocol = JsonReportProtocol::default();
        let mut ctx = stream_ctx().with_device_id(IMEI);
        let data = br#"{"state":{"reported":{"ts":1718000000000,"sp":42,"ign":1}}}"#;

        let messages = protocol.decode(data, &mut ctx).unwrap();
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.device_id(), IMEI);
        assert_eq!(msg.protocol_id(), JSON_REPORT_PROTOCOL_ID);
        assert_eq!(msg.attribute("sp").unwrap().value, json!(42));
        assert_eq!(
            msg.attribute("ign").unwrap().timestamp.timestamp_millis(),
            1718000000000
        );
        assert_eq!(ctx.codec_name.as_deref(), Some(CODEC_JSON));
    }

    #[test]
    fn test_timestamp_is_not_a_reading() {
        let protocol = JsonReportProtocol::default();
        let mut ctx = stream_ctx().with_device_id(IMEI);

        let data = br#"{"state":{"reported":{"ts":1718000000000,"sp":42}}}"#;
        let messages = protocol.decode(data, &mut ctx).unwrap();
        assert_eq!(messages[0].len(), 1);
        assert!(messages[0].attribute(TIMESTAMP_KEY).is_none());

        // a record holding only its timestamp carries nothing
        let only_ts = br#"{"state":{"reported":{"ts":1718000000000}}}"#;
        assert!(protocol.decode(only_ts, &mut ctx).is_err());
    }

    #[test]
    fn test_decode_command_response() {
        let protocol = JsonReportProtocol::default();
        let mut ctx = MessageContext::new(Transport::PubSub).with_device_id(IMEI);

        let flat = protocol.decode(br#"{"RSP":"DOUT1:1"}"#, &mut ctx).unwrap();
        assert_eq!(flat[0].attribute(RESPONSE_ATTRIBUTE).unwrap().value, json!("DOUT1:1"));

        let nested = protocol
            .decode(br#"{"RSP":{"RSP":"DOUT1:0"}}"#, &mut ctx)
            .unwrap();
        assert_eq!(nested[0].attribute(RESPONSE_ATTRIBUTE).unwrap().value, json!("DOUT1:0"));
    }

    #[test]
    fn test_decode_takes_device_id_from_record() {
        let protocol = JsonReportProtocol::default();
        let mut ctx = MessageContext::new(Transport::Datagram);
        let data = br#"{"deviceId":"dev-7","state":{"reported":{"batt":3.9}}}"#;

        let messages = protocol.decode(data, &mut ctx).unwrap();
        assert_eq!(messages[0].device_id(), "dev-7");
        assert_eq!(ctx.device_id(), Some("dev-7"));
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        let protocol = JsonReportProtocol::default();
        let cases: [&[u8]; 6] = [
            b"{\"state\":",
            b"[1,2,3]",
            br#"{"state":{"reported":{}}}"#,
            br#"{"something":"else"}"#,
            br#"{"RSP":null}"#,
            br#"{"state":{"reported":{"ts":"yesterday","sp":1}}}"#,
        ];

        for data in cases {
            let mut ctx = stream_ctx().with_device_id(IMEI);
            let err = protocol.decode(data, &mut ctx).unwrap_err();
            assert_eq!(err.protocol_id.as_deref(), Some(JSON_REPORT_PROTOCOL_ID));
            assert_eq!(err.device_id.as_deref(), Some(IMEI));
        }
    }

    #[test]
    fn test_missing_device_id_is_an_error() {
        let protocol = JsonReportProtocol::default();
        let mut ctx = MessageContext::new(Transport::PubSub);
        let err = protocol
            .decode(br#"{"state":{"reported":{"sp":1}}}"#, &mut ctx)
            .unwrap_err();
        assert!(err.device_id.is_none());
        assert!(err.reason.contains("device id"));
    }

    #[test]
    fn test_split_records_skips_blank_lines() {
        let protocol = JsonReportProtocol::default();
        let data = b"{\"RSP\":\"a\"}\n\n  {\"RSP\":\"b\"}\r\n";
        let records = protocol.split_records(data, &stream_ctx()).unwrap();
        assert_eq!(records, vec![&b"{\"RSP\":\"a\"}"[..], &b"{\"RSP\":\"b\"}"[..]]);
    }

    #[test]
    fn test_encode_and_acknowledge() {
        let protocol = JsonReportProtocol::default();
        let ctx = stream_ctx();

        let encoded = protocol
            .encode_command(&DeviceCommand::set_digital_output(1, true), &ctx)
            .unwrap()
            .unwrap();
        let parsed: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(parsed, json!({"CMD": "setdigout 1 1"}));

        assert_eq!(protocol.acknowledgment(2, &ctx).unwrap().as_ref(), &[0, 0, 0, 2]);
        assert!(protocol.acknowledgment(0, &ctx).is_none());
    }
}
