//! Protocol registry and auto-detection.

use crate::context::MessageContext;
use crate::error::RegistryError;
use crate::protocol::Protocol;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Registered {
    protocol: Arc<dyn Protocol>,
    priority: i32,
    seq: usize,
}

/// Ordered set of protocols probed during detection.
///
/// Probing order is ascending priority, then registration order. Protocols
/// registered without an explicit priority share priority `0`.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    entries: Vec<Registered>,
    next_seq: usize,
}

impl ProtocolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register with default priority
    pub fn register(&mut self, protocol: Arc<dyn Protocol>) -> Result<(), RegistryError> {
        self.register_with_priority(protocol, 0)
    }

    /// Register with an explicit priority (lower probes first)
    pub fn register_with_priority(
        &mut self,
        protocol: Arc<dyn Protocol>,
        priority: i32,
    ) -> Result<(), RegistryError> {
        let id = protocol.protocol_id().to_string();
        if self.get(&id).is_some() {
            return Err(RegistryError::Duplicate(id));
        }

        info!(
            "Registered protocol: id={}, vendor={}, priority={}",
            id,
            protocol.vendor_name(),
            priority
        );
        self.entries.push(Registered {
            protocol,
            priority,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        self.sort();
        Ok(())
    }

    /// Reorder so the listed ids probe first, in list order
    pub fn apply_priority_order(&mut self, order: &[String]) -> Result<(), RegistryError> {
        for id in order {
            if self.get(id).is_none() {
                return Err(RegistryError::Unknown(id.clone()));
            }
        }

        let listed = order.len() as i32;
        for entry in &mut self.entries {
            entry.priority = match order.iter().position(|id| id == entry.protocol.protocol_id()) {
                Some(pos) => pos as i32 - listed,
                None => 0,
            };
        }
        self.sort();
        Ok(())
    }

    /// Look up a protocol by id
    pub fn get(&self, protocol_id: &str) -> Option<Arc<dyn Protocol>> {
        self.entries
            .iter()
            .find(|e| e.protocol.protocol_id() == protocol_id)
            .map(|e| e.protocol.clone())
    }

    /// Protocol ids in probing order
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.protocol.protocol_id().to_string())
            .collect()
    }

    /// Number of registered protocols
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no protocol is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Select the protocol for `data`.
    ///
    /// A codec already cached in the context wins without probing. Otherwise
    /// the first protocol claiming the data is cached into `codec_name`.
    pub fn detect(&self, data: &[u8], context: &mut MessageContext) -> Option<Arc<dyn Protocol>> {
        if let Some(cached) = context.codec_name.as_deref() {
            if let Some(protocol) = self.get(cached) {
                return Some(protocol);
            }
            debug!("Cached codec {} is not registered, probing again", cached);
        }

        for entry in &self.entries {
            if entry.protocol.can_handle(data, context) {
                let id = entry.protocol.protocol_id().to_string();
                debug!(
                    "Detected protocol {} for {} ({} bytes)",
                    id,
                    context.connection_key(),
                    data.len()
                );
                context.codec_name = Some(id);
                return Some(entry.protocol.clone());
            }
        }

        warn!(
            "No protocol claimed {} bytes from {} (device={}), dropping frame",
            data.len(),
            context.connection_key(),
            context.device_id().unwrap_or("-")
        );
        None
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(|e| (e.priority, e.seq));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::DeviceCommand;
    use crate::context::Transport;
    use crate::error::{DecodeError, EncodeError};
    use crate::message::DeviceMessage;
    use bytes::Bytes;

    /// Claims every frame starting with `magic`
    #[derive(Debug)]
    struct MagicProtocol {
        id: &'static str,
        magic: u8,
    }

    impl Protocol for MagicProtocol {
        fn protocol_id(&self) -> &str {
            self.id
        }

        fn vendor_id(&self) -> &str {
            "test"
        }

        fn vendor_name(&self) -> &str {
            "Test Vendor"
        }

        fn can_handle(&self, data: &[u8], _context: &MessageContext) -> bool {
            data.first() == Some(&self.magic)
        }

        fn decode(
            &self,
            _data: &[u8],
            _context: &mut MessageContext,
        ) -> Result<Vec<DeviceMessage>, DecodeError> {
            Ok(Vec::new())
        }

        fn encode_command(
            &self,
            _command: &DeviceCommand,
            _context: &MessageContext,
        ) -> Result<Option<Bytes>, EncodeError> {
            Ok(None)
        }

        fn acknowledgment(&self, _message_count: usize, _context: &MessageContext) -> Option<Bytes> {
            None
        }
    }

    fn magic(id: &'static str, magic: u8) -> Arc<dyn Protocol> {
        Arc::new(MagicProtocol { id, magic })
    }

    #[test]
    fn test_first_registered_claim_wins() {
        let mut registry = ProtocolRegistry::new();
        registry.register(magic("alpha", 0xAA)).unwrap();
        registry.register(magic("beta", 0xAA)).unwrap();

        let mut ctx = MessageContext::new(Transport::Stream);
        let selected = registry.detect(&[0xAA, 0x01], &mut ctx).unwrap();
        assert_eq!(selected.protocol_id(), "alpha");
        assert_eq!(ctx.codec_name.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_explicit_priority_breaks_ties() {
        let mut registry = ProtocolRegistry::new();
        registry.register(magic("alpha", 0xAA)).unwrap();
        registry.register_with_priority(magic("beta", 0xAA), -1).unwrap();

        assert_eq!(registry.ids(), vec!["beta", "alpha"]);
        let mut ctx = MessageContext::new(Transport::Stream);
        assert_eq!(registry.detect(&[0xAA], &mut ctx).unwrap().protocol_id(), "beta");
    }

    #[test]
    fn test_priority_order_from_config() {
        let mut registry = ProtocolRegistry::new();
        registry.register(magic("alpha", 0x01)).unwrap();
        registry.register(magic("beta", 0x02)).unwrap();
        registry.register(magic("gamma", 0x03)).unwrap();

        registry
            .apply_priority_order(&["gamma".to_string(), "beta".to_string()])
            .unwrap();
        assert_eq!(registry.ids(), vec!["gamma", "beta", "alpha"]);

        let err = registry.apply_priority_order(&["delta".to_string()]).unwrap_err();
        assert_eq!(err, RegistryError::Unknown("delta".to_string()));
    }

    #[test]
    fn test_cached_codec_skips_detection() {
        let mut registry = ProtocolRegistry::new();
        registry.register(magic("alpha", 0xAA)).unwrap();
        registry.register(magic("beta", 0xBB)).unwrap();

        let mut ctx = MessageContext::new(Transport::Stream);
        ctx.codec_name = Some("beta".to_string());
        // alpha would claim this frame, but the connection is bound to beta
        let selected = registry.detect(&[0xAA], &mut ctx).unwrap();
        assert_eq!(selected.protocol_id(), "beta");
    }

    #[test]
    fn test_detection_miss_leaves_context_untouched() {
        let mut registry = ProtocolRegistry::new();
        registry.register(magic("alpha", 0xAA)).unwrap();

        let mut ctx = MessageContext::new(Transport::Datagram);
        assert!(registry.detect(&[0x00], &mut ctx).is_none());
        assert!(ctx.codec_name.is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ProtocolRegistry::new();
        registry.register(magic("alpha", 0xAA)).unwrap();
        let err = registry.register(magic("alpha", 0xBB)).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("alpha".to_string()));
        assert_eq!(registry.len(), 1);
    }
}
