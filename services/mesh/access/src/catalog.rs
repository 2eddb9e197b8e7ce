//! Opcode-keyed registry of message decoders.

use mesh_wire::{AccessPdu, Opcode};
use std::collections::HashMap;
use tracing::debug;

use crate::message::*;
use crate::opcodes::*;
use crate::{AccessError, MeshMessage};

/// Decoder for one opcode: `(opcode, parameters) -> message`
pub type DecodeFn = fn(Opcode, &[u8]) -> Result<MeshMessage, AccessError>;

/// Maps opcodes to decoders
///
/// [`MessageCatalog::default`] knows every built-in message; vendor opcodes
/// must be registered before they decode.
#[derive(Clone)]
pub struct MessageCatalog {
    decoders: HashMap<Opcode, DecodeFn>,
}

impl MessageCatalog {
    /// A catalog with nothing registered
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register or replace the decoder for `opcode`
    pub fn register(&mut self, opcode: Opcode, decode: DecodeFn) -> &mut Self {
        if self.decoders.insert(opcode, decode).is_some() {
            debug!("replaced decoder for {}", opcode);
        }
        self
    }

    /// Decode a vendor opcode into [`MeshMessage::Vendor`]
    pub fn register_vendor(&mut self, company_id: u16, opcode: u8) -> &mut Self {
        self.register(Opcode::vendor(opcode, company_id), decode_vendor)
    }

    /// Whether `opcode` has a decoder
    pub fn contains(&self, opcode: Opcode) -> bool {
        self.decoders.contains_key(&opcode)
    }

    /// Number of registered opcodes
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode parameters for a known opcode
    pub fn decode(&self, opcode: Opcode, parameters: &[u8]) -> Result<MeshMessage, AccessError> {
        let decode = self
            .decoders
            .get(&opcode)
            .ok_or(AccessError::UnknownOpcode(opcode))?;
        decode(opcode, parameters)
    }

    /// Decode a whole access payload
    pub fn decode_pdu(&self, payload: &[u8]) -> Result<MeshMessage, AccessError> {
        let pdu = AccessPdu::decode(payload)?;
        self.decode(pdu.opcode, &pdu.parameters)
    }
}

impl Default for MessageCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        catalog
            .register(CONFIG_APPKEY_ADD, decode_app_key_add)
            .register(CONFIG_APPKEY_STATUS, decode_app_key_status)
            .register(CONFIG_COMPOSITION_DATA_GET, decode_composition_get)
            .register(CONFIG_COMPOSITION_DATA_STATUS, decode_composition_status)
            .register(CONFIG_MODEL_APP_BIND, decode_model_app_bind)
            .register(CONFIG_MODEL_APP_STATUS, decode_model_app_status)
            .register(CONFIG_MODEL_SUBSCRIPTION_ADD, decode_subscription_add)
            .register(CONFIG_MODEL_SUBSCRIPTION_STATUS, decode_subscription_status)
            .register(CONFIG_NODE_RESET, decode_node_reset)
            .register(CONFIG_NODE_RESET_STATUS, decode_node_reset_status)
            .register(GENERIC_ONOFF_GET, decode_onoff_get)
            .register(GENERIC_ONOFF_SET, decode_onoff_set)
            .register(GENERIC_ONOFF_SET_UNACKNOWLEDGED, decode_onoff_set_unack)
            .register(GENERIC_ONOFF_STATUS, decode_onoff_status)
            .register(GENERIC_LEVEL_GET, decode_level_get)
            .register(GENERIC_LEVEL_SET, decode_level_set)
            .register(GENERIC_LEVEL_SET_UNACKNOWLEDGED, decode_level_set_unack)
            .register(GENERIC_LEVEL_STATUS, decode_level_status);
        catalog
    }
}

impl std::fmt::Debug for MessageCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<_> = self.decoders.keys().collect();
        opcodes.sort();
        f.debug_struct("MessageCatalog")
            .field("opcodes", &opcodes)
            .finish()
    }
}
