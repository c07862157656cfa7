//! The codec contract every vendor protocol implements.

use crate::command::DeviceCommand;
use crate::context::MessageContext;
use crate::error::{DecodeError, EncodeError};
use crate::message::DeviceMessage;
use bytes::Bytes;
use std::fmt;

/// Stateless codec for one vendor wire format.
///
/// A single instance serves every device speaking the protocol, so
/// implementations keep all per-connection state in the [`MessageContext`].
pub trait Protocol: Send + Sync + fmt::Debug {
    /// Stable protocol id
    fn protocol_id(&self) -> &str;

    /// Stable vendor id
    fn vendor_id(&self) -> &str;

    /// Vendor display name
    fn vendor_name(&self) -> &str;

    /// Whether this protocol understands `data`. Must not mutate anything.
    fn can_handle(&self, data: &[u8], context: &MessageContext) -> bool;

    /// Split a physical frame into independently decodable records
    fn split_records<'a>(
        &self,
        data: &'a [u8],
        _context: &MessageContext,
    ) -> Result<Vec<&'a [u8]>, DecodeError> {
        Ok(vec![data])
    }

    /// Decode one record. An empty vector means the record carried nothing.
    fn decode(
        &self,
        data: &[u8],
        context: &mut MessageContext,
    ) -> Result<Vec<DeviceMessage>, DecodeError>;

    /// Encode a command for transmission, `None` when nothing needs sending
    fn encode_command(
        &self,
        command: &DeviceCommand,
        context: &MessageContext,
    ) -> Result<Option<Bytes>, EncodeError>;

    /// Bytes acknowledging `message_count` decoded messages
    fn acknowledgment(&self, message_count: usize, context: &MessageContext) -> Option<Bytes>;

    /// Process a handshake frame, filling in the device id on success
    fn handle_identification(&self, _data: &[u8], _context: &mut MessageContext) -> bool {
        false
    }

    /// Bytes answering a handshake
    fn identification_response(&self, _accepted: bool, _context: &MessageContext) -> Option<Bytes> {
        None
    }
}
