//! Typed mesh messages.
//!
//! Each message struct knows its parameter layout; [`MeshMessage`] is the
//! closed set the catalog decodes into. Vendor messages keep their
//! parameters opaque.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mesh_crypto::Key128;
use mesh_wire::{AccessPdu, Opcode};
use serde::{Deserialize, Serialize};

use crate::opcodes::*;
use crate::params::{
    expect_len, expect_one_of, pack_key_indexes, unpack_key_indexes, CompositionData,
    ModelIdentifier, Transition, TransitionTime,
};
use crate::{AccessError, StatusEnvelope, StatusMessage};

fn model_at(opcode: Opcode, params: &[u8]) -> Result<ModelIdentifier, AccessError> {
    ModelIdentifier::decode(params).ok_or(AccessError::InvalidParameters {
        opcode,
        reason: "model identifier must be 2 or 4 bytes",
    })
}

fn optional_transition(buf: &[u8]) -> Option<Transition> {
    match buf {
        [time, delay] => Some(Transition {
            time: TransitionTime::from_byte(*time),
            delay: *delay,
        }),
        _ => None,
    }
}

fn put_transition(buf: &mut BytesMut, transition: &Option<Transition>) {
    if let Some(t) = transition {
        buf.put_u8(t.time.to_byte());
        buf.put_u8(t.delay);
    }
}

/// Config AppKey Add
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAppKeyAdd {
    /// Network key the application key is bound to
    pub net_key_index: u16,
    /// Index of the new application key
    pub app_key_index: u16,
    /// Raw application key
    pub app_key: Key128,
}

impl ConfigAppKeyAdd {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), AccessError> {
        buf.put_slice(&pack_key_indexes(self.net_key_index, self.app_key_index)?);
        buf.put_slice(&self.app_key);
        Ok(())
    }

    fn decode(opcode: Opcode, params: &[u8]) -> Result<Self, AccessError> {
        expect_len(opcode, params, 19)?;
        let (net_key_index, app_key_index) = unpack_key_indexes([params[0], params[1], params[2]]);
        let mut app_key = [0u8; 16];
        app_key.copy_from_slice(&params[3..]);
        Ok(Self {
            net_key_index,
            app_key_index,
            app_key,
        })
    }
}

/// Config AppKey Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAppKeyStatus {
    /// Status code
    pub status: StatusEnvelope,
    /// Network key index from the request
    pub net_key_index: u16,
    /// Application key index from the request
    pub app_key_index: u16,
}

impl ConfigAppKeyStatus {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), AccessError> {
        buf.put_u8(self.status.code.code());
        buf.put_slice(&pack_key_indexes(self.net_key_index, self.app_key_index)?);
        Ok(())
    }

    fn decode(opcode: Opcode, params: &[u8]) -> Result<Self, AccessError> {
        expect_len(opcode, params, 4)?;
        let (net_key_index, app_key_index) = unpack_key_indexes([params[1], params[2], params[3]]);
        Ok(Self {
            status: StatusEnvelope::from(params[0]),
            net_key_index,
            app_key_index,
        })
    }
}

impl StatusMessage for ConfigAppKeyStatus {
    fn envelope(&self) -> &StatusEnvelope {
        &self.status
    }
}

/// Config Composition Data Status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigCompositionDataStatus {
    /// Page number
    pub page: u8,
    /// Raw page contents
    pub data: Bytes,
}

impl ConfigCompositionDataStatus {
    /// Parse the page as composition data page 0
    pub fn page_zero(&self) -> Result<CompositionData, AccessError> {
        if self.page != 0 {
            return Err(AccessError::InvalidParameters {
                opcode: CONFIG_COMPOSITION_DATA_STATUS,
                reason: "not page 0",
            });
        }
        CompositionData::decode(&self.data).map_err(|reason| AccessError::InvalidParameters {
            opcode: CONFIG_COMPOSITION_DATA_STATUS,
            reason,
        })
    }

    fn decode(opcode: Opcode, params: &[u8]) -> Result<Self, AccessError> {
        if params.is_empty() {
            return Err(AccessError::Length {
                opcode,
                expected: 1,
                got: 0,
            });
        }
        Ok(Self {
            page: params[0],
            data: Bytes::copy_from_slice(&params[1..]),
        })
    }
}

/// Config Model App Bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigModelAppBind {
    /// Address of the element holding the model
    pub element_address: u16,
    /// Application key to bind
    pub app_key_index: u16,
    /// Model to bind
    pub model: ModelIdentifier,
}

impl ConfigModelAppBind {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.element_address);
        buf.put_u16_le(self.app_key_index);
        self.model.encode(buf);
    }

    fn decode(opcode: Opcode, mut params: &[u8]) -> Result<Self, AccessError> {
        expect_one_of(opcode, params, &[6, 8])?;
        let element_address = params.get_u16_le();
        let app_key_index = params.get_u16_le();
        Ok(Self {
            element_address,
            app_key_index,
            model: model_at(opcode, params)?,
        })
    }
}

/// Config Model App Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigModelAppStatus {
    /// Status code
    pub status: StatusEnvelope,
    /// Element address from the request
    pub element_address: u16,
    /// Application key index from the request
    pub app_key_index: u16,
    /// Model from the request
    pub model: ModelIdentifier,
}

impl ConfigModelAppStatus {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status.code.code());
        buf.put_u16_le(self.element_address);
        buf.put_u16_le(self.app_key_index);
        self.model.encode(buf);
    }

    fn decode(opcode: Opcode, mut params: &[u8]) -> Result<Self, AccessError> {
        expect_one_of(opcode, params, &[7, 9])?;
        let status = StatusEnvelope::from(params.get_u8());
        let element_address = params.get_u16_le();
        let app_key_index = params.get_u16_le();
        Ok(Self {
            status,
            element_address,
            app_key_index,
            model: model_at(opcode, params)?,
        })
    }
}

impl StatusMessage for ConfigModelAppStatus {
    fn envelope(&self) -> &StatusEnvelope {
        &self.status
    }
}

/// Config Model Subscription Add
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigModelSubscriptionAdd {
    /// Address of the element holding the model
    pub element_address: u16,
    /// Group address to subscribe to
    pub address: u16,
    /// Model to subscribe
    pub model: ModelIdentifier,
}

impl ConfigModelSubscriptionAdd {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.element_address);
        buf.put_u16_le(self.address);
        self.model.encode(buf);
    }

    fn decode(opcode: Opcode, mut params: &[u8]) -> Result<Self, AccessError> {
        expect_one_of(opcode, params, &[6, 8])?;
        let element_address = params.get_u16_le();
        let address = params.get_u16_le();
        Ok(Self {
            element_address,
            address,
            model: model_at(opcode, params)?,
        })
    }
}

/// Config Model Subscription Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigModelSubscriptionStatus {
    /// Status code
    pub status: StatusEnvelope,
    /// Element address from the request
    pub element_address: u16,
    /// Subscription address from the request
    pub address: u16,
    /// Model from the request
    pub model: ModelIdentifier,
}

impl ConfigModelSubscriptionStatus {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status.code.code());
        buf.put_u16_le(self.element_address);
        buf.put_u16_le(self.address);
        self.model.encode(buf);
    }

    fn decode(opcode: Opcode, mut params: &[u8]) -> Result<Self, AccessError> {
        expect_one_of(opcode, params, &[7, 9])?;
        let status = StatusEnvelope::from(params.get_u8());
        let element_address = params.get_u16_le();
        let address = params.get_u16_le();
        Ok(Self {
            status,
            element_address,
            address,
            model: model_at(opcode, params)?,
        })
    }
}

impl StatusMessage for ConfigModelSubscriptionStatus {
    fn envelope(&self) -> &StatusEnvelope {
        &self.status
    }
}

/// Generic OnOff Set, acknowledged or not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericOnOffSet {
    /// Target state
    pub on: bool,
    /// Transaction identifier
    pub tid: u8,
    /// Optional transition
    pub transition: Option<Transition>,
}

impl GenericOnOffSet {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.on as u8);
        buf.put_u8(self.tid);
        put_transition(buf, &self.transition);
    }

    fn decode(opcode: Opcode, params: &[u8]) -> Result<Self, AccessError> {
        expect_one_of(opcode, params, &[2, 4])?;
        Ok(Self {
            on: onoff_value(opcode, params[0])?,
            tid: params[1],
            transition: optional_transition(&params[2..]),
        })
    }
}

fn onoff_value(opcode: Opcode, byte: u8) -> Result<bool, AccessError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(AccessError::InvalidParameters {
            opcode,
            reason: "onoff must be 0 or 1",
        }),
    }
}

/// Generic OnOff Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericOnOffStatus {
    /// Present state
    pub present: bool,
    /// Target state and remaining time while transitioning
    pub target: Option<(bool, TransitionTime)>,
}

impl GenericOnOffStatus {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.present as u8);
        if let Some((target, remaining)) = self.target {
            buf.put_u8(target as u8);
            buf.put_u8(remaining.to_byte());
        }
    }

    fn decode(opcode: Opcode, params: &[u8]) -> Result<Self, AccessError> {
        expect_one_of(opcode, params, &[1, 3])?;
        let target = match params {
            [_, target, remaining] => Some((
                onoff_value(opcode, *target)?,
                TransitionTime::from_byte(*remaining),
            )),
            _ => None,
        };
        Ok(Self {
            present: onoff_value(opcode, params[0])?,
            target,
        })
    }
}

/// Generic Level Set, acknowledged or not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericLevelSet {
    /// Target level
    pub level: i16,
    /// Transaction identifier
    pub tid: u8,
    /// Optional transition
    pub transition: Option<Transition>,
}

impl GenericLevelSet {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16_le(self.level);
        buf.put_u8(self.tid);
        put_transition(buf, &self.transition);
    }

    fn decode(opcode: Opcode, mut params: &[u8]) -> Result<Self, AccessError> {
        expect_one_of(opcode, params, &[3, 5])?;
        let level = params.get_i16_le();
        let tid = params.get_u8();
        Ok(Self {
            level,
            tid,
            transition: optional_transition(params),
        })
    }
}

/// Generic Level Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericLevelStatus {
    /// Present level
    pub present: i16,
    /// Target level and remaining time while transitioning
    pub target: Option<(i16, TransitionTime)>,
}

impl GenericLevelStatus {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16_le(self.present);
        if let Some((target, remaining)) = self.target {
            buf.put_i16_le(target);
            buf.put_u8(remaining.to_byte());
        }
    }

    fn decode(opcode: Opcode, mut params: &[u8]) -> Result<Self, AccessError> {
        expect_one_of(opcode, params, &[2, 5])?;
        let present = params.get_i16_le();
        let target = if params.has_remaining() {
            let target = params.get_i16_le();
            Some((target, TransitionTime::from_byte(params.get_u8())))
        } else {
            None
        };
        Ok(Self { present, target })
    }
}

/// A vendor model message with opaque parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorMessage {
    /// Three-byte vendor opcode
    pub opcode: Opcode,
    /// Raw parameters
    pub parameters: Bytes,
    /// Status opcode expected in reply, for acknowledged sends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Opcode>,
}

impl VendorMessage {
    /// Unacknowledged vendor message
    pub fn new(company_id: u16, opcode: u8, parameters: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::vendor(opcode, company_id),
            parameters: parameters.into(),
            response: None,
        }
    }

    /// Vendor message answered with `response_opcode` from the same company
    pub fn acknowledged(
        company_id: u16,
        opcode: u8,
        parameters: impl Into<Bytes>,
        response_opcode: u8,
    ) -> Self {
        Self {
            response: Some(Opcode::vendor(response_opcode, company_id)),
            ..Self::new(company_id, opcode, parameters)
        }
    }
}

/// Every message the access layer understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum MeshMessage {
    /// Config AppKey Add
    AppKeyAdd(ConfigAppKeyAdd),
    /// Config AppKey Status
    AppKeyStatus(ConfigAppKeyStatus),
    /// Config Composition Data Get for a page
    CompositionDataGet {
        /// Requested page
        page: u8,
    },
    /// Config Composition Data Status
    CompositionDataStatus(ConfigCompositionDataStatus),
    /// Config Model App Bind
    ModelAppBind(ConfigModelAppBind),
    /// Config Model App Status
    ModelAppStatus(ConfigModelAppStatus),
    /// Config Model Subscription Add
    ModelSubscriptionAdd(ConfigModelSubscriptionAdd),
    /// Config Model Subscription Status
    ModelSubscriptionStatus(ConfigModelSubscriptionStatus),
    /// Config Node Reset
    NodeReset,
    /// Config Node Reset Status
    NodeResetStatus,
    /// Generic OnOff Get
    GenericOnOffGet,
    /// Generic OnOff Set
    GenericOnOffSet(GenericOnOffSet),
    /// Generic OnOff Set Unacknowledged
    GenericOnOffSetUnacknowledged(GenericOnOffSet),
    /// Generic OnOff Status
    GenericOnOffStatus(GenericOnOffStatus),
    /// Generic Level Get
    GenericLevelGet,
    /// Generic Level Set
    GenericLevelSet(GenericLevelSet),
    /// Generic Level Set Unacknowledged
    GenericLevelSetUnacknowledged(GenericLevelSet),
    /// Generic Level Status
    GenericLevelStatus(GenericLevelStatus),
    /// Vendor model message
    Vendor(VendorMessage),
}

impl MeshMessage {
    /// Opcode on the wire
    pub fn opcode(&self) -> Opcode {
        match self {
            MeshMessage::AppKeyAdd(_) => CONFIG_APPKEY_ADD,
            MeshMessage::AppKeyStatus(_) => CONFIG_APPKEY_STATUS,
            MeshMessage::CompositionDataGet { .. } => CONFIG_COMPOSITION_DATA_GET,
            MeshMessage::CompositionDataStatus(_) => CONFIG_COMPOSITION_DATA_STATUS,
            MeshMessage::ModelAppBind(_) => CONFIG_MODEL_APP_BIND,
            MeshMessage::ModelAppStatus(_) => CONFIG_MODEL_APP_STATUS,
            MeshMessage::ModelSubscriptionAdd(_) => CONFIG_MODEL_SUBSCRIPTION_ADD,
            MeshMessage::ModelSubscriptionStatus(_) => CONFIG_MODEL_SUBSCRIPTION_STATUS,
            MeshMessage::NodeReset => CONFIG_NODE_RESET,
            MeshMessage::NodeResetStatus => CONFIG_NODE_RESET_STATUS,
            MeshMessage::GenericOnOffGet => GENERIC_ONOFF_GET,
            MeshMessage::GenericOnOffSet(_) => GENERIC_ONOFF_SET,
            MeshMessage::GenericOnOffSetUnacknowledged(_) => GENERIC_ONOFF_SET_UNACKNOWLEDGED,
            MeshMessage::GenericOnOffStatus(_) => GENERIC_ONOFF_STATUS,
            MeshMessage::GenericLevelGet => GENERIC_LEVEL_GET,
            MeshMessage::GenericLevelSet(_) => GENERIC_LEVEL_SET,
            MeshMessage::GenericLevelSetUnacknowledged(_) => GENERIC_LEVEL_SET_UNACKNOWLEDGED,
            MeshMessage::GenericLevelStatus(_) => GENERIC_LEVEL_STATUS,
            MeshMessage::Vendor(v) => v.opcode,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            MeshMessage::AppKeyAdd(_) => "Config AppKey Add",
            MeshMessage::AppKeyStatus(_) => "Config AppKey Status",
            MeshMessage::CompositionDataGet { .. } => "Config Composition Data Get",
            MeshMessage::CompositionDataStatus(_) => "Config Composition Data Status",
            MeshMessage::ModelAppBind(_) => "Config Model App Bind",
            MeshMessage::ModelAppStatus(_) => "Config Model App Status",
            MeshMessage::ModelSubscriptionAdd(_) => "Config Model Subscription Add",
            MeshMessage::ModelSubscriptionStatus(_) => "Config Model Subscription Status",
            MeshMessage::NodeReset => "Config Node Reset",
            MeshMessage::NodeResetStatus => "Config Node Reset Status",
            MeshMessage::GenericOnOffGet => "Generic OnOff Get",
            MeshMessage::GenericOnOffSet(_) => "Generic OnOff Set",
            MeshMessage::GenericOnOffSetUnacknowledged(_) => "Generic OnOff Set Unacknowledged",
            MeshMessage::GenericOnOffStatus(_) => "Generic OnOff Status",
            MeshMessage::GenericLevelGet => "Generic Level Get",
            MeshMessage::GenericLevelSet(_) => "Generic Level Set",
            MeshMessage::GenericLevelSetUnacknowledged(_) => "Generic Level Set Unacknowledged",
            MeshMessage::GenericLevelStatus(_) => "Generic Level Status",
            MeshMessage::Vendor(_) => "Vendor",
        }
    }

    /// Opcode of the status that answers this request, if it is acknowledged
    pub fn response_opcode(&self) -> Option<Opcode> {
        match self {
            MeshMessage::AppKeyAdd(_) => Some(CONFIG_APPKEY_STATUS),
            MeshMessage::CompositionDataGet { .. } => Some(CONFIG_COMPOSITION_DATA_STATUS),
            MeshMessage::ModelAppBind(_) => Some(CONFIG_MODEL_APP_STATUS),
            MeshMessage::ModelSubscriptionAdd(_) => Some(CONFIG_MODEL_SUBSCRIPTION_STATUS),
            MeshMessage::NodeReset => Some(CONFIG_NODE_RESET_STATUS),
            MeshMessage::GenericOnOffGet | MeshMessage::GenericOnOffSet(_) => {
                Some(GENERIC_ONOFF_STATUS)
            }
            MeshMessage::GenericLevelGet | MeshMessage::GenericLevelSet(_) => {
                Some(GENERIC_LEVEL_STATUS)
            }
            MeshMessage::Vendor(v) => v.response,
            _ => None,
        }
    }

    /// Configuration messages are secured with the device key
    pub fn uses_device_key(&self) -> bool {
        matches!(
            self,
            MeshMessage::AppKeyAdd(_)
                | MeshMessage::AppKeyStatus(_)
                | MeshMessage::CompositionDataGet { .. }
                | MeshMessage::CompositionDataStatus(_)
                | MeshMessage::ModelAppBind(_)
                | MeshMessage::ModelAppStatus(_)
                | MeshMessage::ModelSubscriptionAdd(_)
                | MeshMessage::ModelSubscriptionStatus(_)
                | MeshMessage::NodeReset
                | MeshMessage::NodeResetStatus
        )
    }

    /// Config status view, for messages that carry a status code
    pub fn as_status(&self) -> Option<&dyn StatusMessage> {
        match self {
            MeshMessage::AppKeyStatus(m) => Some(m),
            MeshMessage::ModelAppStatus(m) => Some(m),
            MeshMessage::ModelSubscriptionStatus(m) => Some(m),
            _ => None,
        }
    }

    /// Serialize the parameters
    pub fn encode_parameters(&self) -> Result<Bytes, AccessError> {
        let mut buf = BytesMut::new();
        match self {
            MeshMessage::AppKeyAdd(m) => m.encode(&mut buf)?,
            MeshMessage::AppKeyStatus(m) => m.encode(&mut buf)?,
            MeshMessage::CompositionDataGet { page } => buf.put_u8(*page),
            MeshMessage::CompositionDataStatus(m) => {
                buf.put_u8(m.page);
                buf.put_slice(&m.data);
            }
            MeshMessage::ModelAppBind(m) => m.encode(&mut buf),
            MeshMessage::ModelAppStatus(m) => m.encode(&mut buf),
            MeshMessage::ModelSubscriptionAdd(m) => m.encode(&mut buf),
            MeshMessage::ModelSubscriptionStatus(m) => m.encode(&mut buf),
            MeshMessage::NodeReset
            | MeshMessage::NodeResetStatus
            | MeshMessage::GenericOnOffGet
            | MeshMessage::GenericLevelGet => {}
            MeshMessage::GenericOnOffSet(m) | MeshMessage::GenericOnOffSetUnacknowledged(m) => {
                m.encode(&mut buf)
            }
            MeshMessage::GenericOnOffStatus(m) => m.encode(&mut buf),
            MeshMessage::GenericLevelSet(m) | MeshMessage::GenericLevelSetUnacknowledged(m) => {
                m.encode(&mut buf)
            }
            MeshMessage::GenericLevelStatus(m) => m.encode(&mut buf),
            MeshMessage::Vendor(m) => buf.put_slice(&m.parameters),
        }
        Ok(buf.freeze())
    }

    /// Build the access PDU
    pub fn to_pdu(&self) -> Result<AccessPdu, AccessError> {
        Ok(AccessPdu::new(self.opcode(), self.encode_parameters()?))
    }

    /// Serialize opcode and parameters
    pub fn encode(&self) -> Result<Bytes, AccessError> {
        Ok(self.to_pdu()?.encode()?)
    }
}

pub(crate) fn decode_app_key_add(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    ConfigAppKeyAdd::decode(op, p).map(MeshMessage::AppKeyAdd)
}

pub(crate) fn decode_app_key_status(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    ConfigAppKeyStatus::decode(op, p).map(MeshMessage::AppKeyStatus)
}

pub(crate) fn decode_composition_get(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    expect_len(op, p, 1)?;
    Ok(MeshMessage::CompositionDataGet { page: p[0] })
}

pub(crate) fn decode_composition_status(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    ConfigCompositionDataStatus::decode(op, p).map(MeshMessage::CompositionDataStatus)
}

pub(crate) fn decode_model_app_bind(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    ConfigModelAppBind::decode(op, p).map(MeshMessage::ModelAppBind)
}

pub(crate) fn decode_model_app_status(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    ConfigModelAppStatus::decode(op, p).map(MeshMessage::ModelAppStatus)
}

pub(crate) fn decode_subscription_add(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    ConfigModelSubscriptionAdd::decode(op, p).map(MeshMessage::ModelSubscriptionAdd)
}

pub(crate) fn decode_subscription_status(
    op: Opcode,
    p: &[u8],
) -> Result<MeshMessage, AccessError> {
    ConfigModelSubscriptionStatus::decode(op, p).map(MeshMessage::ModelSubscriptionStatus)
}

pub(crate) fn decode_node_reset(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    expect_len(op, p, 0)?;
    Ok(MeshMessage::NodeReset)
}

pub(crate) fn decode_node_reset_status(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    expect_len(op, p, 0)?;
    Ok(MeshMessage::NodeResetStatus)
}

pub(crate) fn decode_onoff_get(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    expect_len(op, p, 0)?;
    Ok(MeshMessage::GenericOnOffGet)
}

pub(crate) fn decode_onoff_set(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    GenericOnOffSet::decode(op, p).map(MeshMessage::GenericOnOffSet)
}

pub(crate) fn decode_onoff_set_unack(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    GenericOnOffSet::decode(op, p).map(MeshMessage::GenericOnOffSetUnacknowledged)
}

pub(crate) fn decode_onoff_status(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    GenericOnOffStatus::decode(op, p).map(MeshMessage::GenericOnOffStatus)
}

pub(crate) fn decode_level_get(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    expect_len(op, p, 0)?;
    Ok(MeshMessage::GenericLevelGet)
}

pub(crate) fn decode_level_set(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    GenericLevelSet::decode(op, p).map(MeshMessage::GenericLevelSet)
}

pub(crate) fn decode_level_set_unack(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    GenericLevelSet::decode(op, p).map(MeshMessage::GenericLevelSetUnacknowledged)
}

pub(crate) fn decode_level_status(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    GenericLevelStatus::decode(op, p).map(MeshMessage::GenericLevelStatus)
}

pub(crate) fn decode_vendor(op: Opcode, p: &[u8]) -> Result<MeshMessage, AccessError> {
    Ok(MeshMessage::Vendor(VendorMessage {
        opcode: op,
        parameters: Bytes::copy_from_slice(p),
        response: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigStatus, StepResolution};

    #[test]
    fn test_app_key_add_layout() {
        let message = MeshMessage::AppKeyAdd(ConfigAppKeyAdd {
            net_key_index: 0x000,
            app_key_index: 0x001,
            app_key: [0x63; 16],
        });
        let bytes = message.encode().unwrap();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(&bytes[1..4], &[0x00, 0x10, 0x00]);
        assert_eq!(&bytes[4..], &[0x63; 16]);
        assert!(message.uses_device_key());
        assert_eq!(message.response_opcode(), Some(CONFIG_APPKEY_STATUS));
    }

    #[test]
    fn test_app_key_status_envelope() {
        let status = decode_app_key_status(CONFIG_APPKEY_STATUS, &[0x05, 0x23, 0x61, 0x45]).unwrap();
        let view = status.as_status().unwrap();
        assert!(!view.is_successful());
        assert_eq!(view.status(), ConfigStatus::InsufficientResources);
        match status {
            MeshMessage::AppKeyStatus(m) => {
                assert_eq!(m.net_key_index, 0x123);
                assert_eq!(m.app_key_index, 0x456);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(decode_app_key_status(CONFIG_APPKEY_STATUS, &[0x00, 0x00]).is_err());
    }

    #[test]
    fn test_model_app_bind_vendor_model() {
        let message = MeshMessage::ModelAppBind(ConfigModelAppBind {
            element_address: 0x0005,
            app_key_index: 1,
            model: ModelIdentifier::Vendor {
                company_id: 0x0059,
                model_id: 0x0001,
            },
        });
        let params = message.encode_parameters().unwrap();
        assert_eq!(params.as_ref(), &[0x05, 0x00, 0x01, 0x00, 0x59, 0x00, 0x01, 0x00]);
        assert_eq!(decode_model_app_bind(CONFIG_MODEL_APP_BIND, &params).unwrap(), message);
        assert!(decode_model_app_bind(CONFIG_MODEL_APP_BIND, &params[..7]).is_err());
    }

    #[test]
    fn test_onoff_set_with_transition() {
        let message = MeshMessage::GenericOnOffSet(GenericOnOffSet {
            on: true,
            tid: 7,
            transition: Some(Transition {
                time: TransitionTime {
                    resolution: StepResolution::Second,
                    steps: 2,
                },
                delay: 10,
            }),
        });
        let bytes = message.encode().unwrap();
        assert_eq!(bytes.as_ref(), &[0x82, 0x02, 0x01, 0x07, 0x42, 0x0A]);
        assert!(!message.uses_device_key());

        assert!(decode_onoff_set(GENERIC_ONOFF_SET, &[0x02, 0x00]).is_err());
        assert!(decode_onoff_set(GENERIC_ONOFF_SET, &[0x01, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_level_status_optional_target() {
        let present_only = decode_level_status(GENERIC_LEVEL_STATUS, &[0x00, 0x80]).unwrap();
        assert_eq!(
            present_only,
            MeshMessage::GenericLevelStatus(GenericLevelStatus {
                present: i16::MIN,
                target: None,
            })
        );
        let moving =
            decode_level_status(GENERIC_LEVEL_STATUS, &[0x00, 0x00, 0xFF, 0x7F, 0x45]).unwrap();
        match moving {
            MeshMessage::GenericLevelStatus(s) => {
                let (target, remaining) = s.target.unwrap();
                assert_eq!(target, i16::MAX);
                assert_eq!(remaining.resolution, StepResolution::Second);
                assert_eq!(remaining.steps, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(decode_level_status(GENERIC_LEVEL_STATUS, &[0x00, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_vendor_acknowledged() {
        let message = MeshMessage::Vendor(VendorMessage::acknowledged(0x0059, 0x01, vec![1, 2], 0x02));
        assert_eq!(message.response_opcode(), Some(Opcode::vendor(0x02, 0x0059)));
        assert_eq!(message.encode().unwrap().as_ref(), &[0xC1, 0x59, 0x00, 1, 2]);
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(MeshMessage::CompositionDataGet { page: 0 }).unwrap();
        assert_eq!(json["message"], "composition_data_get");
        assert_eq!(json["page"], 0);
    }
}
