//! Parameter encodings shared by several messages.
//!
//! Access-layer integers are little-endian, unlike the lower layers.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use mesh_wire::Opcode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::AccessError;

/// Highest 12-bit key index
pub const MAX_KEY_INDEX: u16 = 0x0FFF;

/// Pack a NetKeyIndex (low 12 bits) and AppKeyIndex (high 12 bits) into 3 bytes
pub fn pack_key_indexes(net_key_index: u16, app_key_index: u16) -> Result<[u8; 3], AccessError> {
    for index in [net_key_index, app_key_index] {
        if index > MAX_KEY_INDEX {
            return Err(AccessError::InvalidKeyIndex(index));
        }
    }
    let packed = net_key_index as u32 | (app_key_index as u32) << 12;
    let bytes = packed.to_le_bytes();
    Ok([bytes[0], bytes[1], bytes[2]])
}

/// Inverse of [`pack_key_indexes`]
pub fn unpack_key_indexes(bytes: [u8; 3]) -> (u16, u16) {
    let packed = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
    ((packed & 0xFFF) as u16, (packed >> 12) as u16)
}

/// Check the exact parameter length for an opcode
pub(crate) fn expect_len(opcode: Opcode, params: &[u8], expected: usize) -> Result<(), AccessError> {
    if params.len() != expected {
        return Err(AccessError::Length {
            opcode,
            expected,
            got: params.len(),
        });
    }
    Ok(())
}

/// Check that the length is one of `accepted`
pub(crate) fn expect_one_of(
    opcode: Opcode,
    params: &[u8],
    accepted: &[usize],
) -> Result<(), AccessError> {
    if !accepted.contains(&params.len()) {
        return Err(AccessError::Length {
            opcode,
            expected: accepted.iter().copied().min().unwrap_or(0),
            got: params.len(),
        });
    }
    Ok(())
}

/// Step resolution of a transition time
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepResolution {
    /// 100 milliseconds
    HundredMillis = 0,
    /// 1 second
    Second = 1,
    /// 10 seconds
    TenSeconds = 2,
    /// 10 minutes
    TenMinutes = 3,
}

impl StepResolution {
    /// Length of one step
    pub fn step(self) -> Duration {
        match self {
            StepResolution::HundredMillis => Duration::from_millis(100),
            StepResolution::Second => Duration::from_secs(1),
            StepResolution::TenSeconds => Duration::from_secs(10),
            StepResolution::TenMinutes => Duration::from_secs(600),
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => StepResolution::HundredMillis,
            1 => StepResolution::Second,
            2 => StepResolution::TenSeconds,
            _ => StepResolution::TenMinutes,
        }
    }
}

/// Generic default transition time: resolution in the top two bits, 6-bit step count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionTime {
    /// Step resolution
    pub resolution: StepResolution,
    /// Number of steps, 0x3F meaning unknown
    pub steps: u8,
}

impl TransitionTime {
    /// Largest known step count
    pub const MAX_STEPS: u8 = 0x3E;
    /// Step count reported when the remaining time cannot be determined
    pub const UNKNOWN_STEPS: u8 = 0x3F;

    /// Immediate transition
    pub fn immediate() -> Self {
        Self {
            resolution: StepResolution::HundredMillis,
            steps: 0,
        }
    }

    /// Closest representation of `duration`, preferring the finest resolution
    ///
    /// Durations above 62 × 10 minutes saturate.
    pub fn from_duration(duration: Duration) -> Self {
        let resolutions = [
            StepResolution::HundredMillis,
            StepResolution::Second,
            StepResolution::TenSeconds,
            StepResolution::TenMinutes,
        ];
        for resolution in resolutions {
            let step = resolution.step().as_millis();
            let steps = (duration.as_millis() + step / 2) / step;
            if steps <= Self::MAX_STEPS as u128 {
                return Self {
                    resolution,
                    steps: steps as u8,
                };
            }
        }
        Self {
            resolution: StepResolution::TenMinutes,
            steps: Self::MAX_STEPS,
        }
    }

    /// Duration, or `None` when unknown
    pub fn duration(&self) -> Option<Duration> {
        if self.steps > Self::MAX_STEPS {
            return None;
        }
        Some(self.resolution.step() * self.steps as u32)
    }

    /// Encoded byte
    pub fn to_byte(self) -> u8 {
        (self.resolution as u8) << 6 | (self.steps & 0x3F)
    }

    /// Decode a transition time byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            resolution: StepResolution::from_bits(byte >> 6),
            steps: byte & 0x3F,
        }
    }
}

/// Optional transition and delay of a Set message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transition {
    /// Transition time
    pub time: TransitionTime,
    /// Delay before execution in 5 ms steps
    pub delay: u8,
}

impl Transition {
    /// Duration of one delay step
    pub const DELAY_STEP: Duration = Duration::from_millis(5);

    /// Delay as a duration
    pub fn delay(&self) -> Duration {
        Self::DELAY_STEP * self.delay as u32
    }
}

/// A SIG or vendor model identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelIdentifier {
    /// 16-bit SIG model
    Sig(u16),
    /// Vendor model with its company identifier
    Vendor {
        /// Bluetooth SIG company identifier
        company_id: u16,
        /// Vendor-assigned model ID
        model_id: u16,
    },
}

impl ModelIdentifier {
    /// Generic OnOff Server
    pub const GENERIC_ONOFF_SERVER: ModelIdentifier = ModelIdentifier::Sig(0x1000);
    /// Generic OnOff Client
    pub const GENERIC_ONOFF_CLIENT: ModelIdentifier = ModelIdentifier::Sig(0x1001);
    /// Generic Level Server
    pub const GENERIC_LEVEL_SERVER: ModelIdentifier = ModelIdentifier::Sig(0x1002);
    /// Configuration Server
    pub const CONFIG_SERVER: ModelIdentifier = ModelIdentifier::Sig(0x0000);

    /// Flat 32-bit form: SIG IDs as-is, vendor IDs as `company << 16 | model`
    pub fn id(&self) -> u32 {
        match *self {
            ModelIdentifier::Sig(id) => id as u32,
            ModelIdentifier::Vendor {
                company_id,
                model_id,
            } => (company_id as u32) << 16 | model_id as u32,
        }
    }

    /// Wire size (2 or 4)
    pub fn encoded_len(&self) -> usize {
        match self {
            ModelIdentifier::Sig(_) => 2,
            ModelIdentifier::Vendor { .. } => 4,
        }
    }

    /// Append the little-endian wire form
    pub fn encode(&self, buf: &mut BytesMut) {
        match *self {
            ModelIdentifier::Sig(id) => buf.put_u16_le(id),
            ModelIdentifier::Vendor {
                company_id,
                model_id,
            } => {
                buf.put_u16_le(company_id);
                buf.put_u16_le(model_id);
            }
        }
    }

    /// Parse a model identifier that fills the rest of `buf` (2 or 4 bytes)
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        match buf.len() {
            2 => Some(ModelIdentifier::Sig(buf.get_u16_le())),
            4 => {
                let company_id = buf.get_u16_le();
                let model_id = buf.get_u16_le();
                Some(ModelIdentifier::Vendor {
                    company_id,
                    model_id,
                })
            }
            _ => None,
        }
    }
}

bitflags! {
    /// Features advertised in composition data
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Features: u16 {
        /// Relay
        const RELAY = 1 << 0;
        /// Proxy
        const PROXY = 1 << 1;
        /// Friend
        const FRIEND = 1 << 2;
        /// Low power
        const LOW_POWER = 1 << 3;
    }
}

/// One element of composition data page 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    /// GATT namespace location descriptor
    pub location: u16,
    /// SIG models, then vendor models
    pub models: Vec<ModelIdentifier>,
}

/// Composition data page 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionData {
    /// Company identifier
    pub company_id: u16,
    /// Product identifier
    pub product_id: u16,
    /// Product version
    pub version_id: u16,
    /// Minimum replay protection list entries
    pub crpl: u16,
    /// Supported features
    pub features: Features,
    /// Elements in address order
    pub elements: Vec<Element>,
}

impl CompositionData {
    const HEADER_SIZE: usize = 10;

    /// Parse page 0
    pub fn decode(mut buf: &[u8]) -> Result<Self, &'static str> {
        if buf.len() < Self::HEADER_SIZE {
            return Err("composition header truncated");
        }
        let company_id = buf.get_u16_le();
        let product_id = buf.get_u16_le();
        let version_id = buf.get_u16_le();
        let crpl = buf.get_u16_le();
        let features = Features::from_bits_retain(buf.get_u16_le());

        let mut elements = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err("element header truncated");
            }
            let location = buf.get_u16_le();
            let num_sig = buf.get_u8() as usize;
            let num_vendor = buf.get_u8() as usize;
            if buf.remaining() < num_sig * 2 + num_vendor * 4 {
                return Err("model list truncated");
            }
            let mut models = Vec::with_capacity(num_sig + num_vendor);
            for _ in 0..num_sig {
                models.push(ModelIdentifier::Sig(buf.get_u16_le()));
            }
            for _ in 0..num_vendor {
                let company_id = buf.get_u16_le();
                let model_id = buf.get_u16_le();
                models.push(ModelIdentifier::Vendor {
                    company_id,
                    model_id,
                });
            }
            elements.push(Element { location, models });
        }
        if elements.is_empty() {
            return Err("no elements");
        }

        Ok(Self {
            company_id,
            product_id,
            version_id,
            crpl,
            features,
            elements,
        })
    }

    /// Serialize page 0
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.company_id);
        buf.put_u16_le(self.product_id);
        buf.put_u16_le(self.version_id);
        buf.put_u16_le(self.crpl);
        buf.put_u16_le(self.features.bits());
        for element in &self.elements {
            let (sig, vendor): (Vec<&ModelIdentifier>, Vec<&ModelIdentifier>) = element
                .models
                .iter()
                .partition(|m| matches!(m, ModelIdentifier::Sig(_)));
            buf.put_u16_le(element.location);
            buf.put_u8(sig.len() as u8);
            buf.put_u8(vendor.len() as u8);
            for model in sig.iter().chain(vendor.iter()) {
                model.encode(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_index_packing() {
        // NetKeyIndex 0x123, AppKeyIndex 0x456
        let packed = pack_key_indexes(0x123, 0x456).unwrap();
        assert_eq!(packed, [0x23, 0x61, 0x45]);
        assert_eq!(unpack_key_indexes(packed), (0x123, 0x456));
        assert_eq!(
            pack_key_indexes(0x1000, 0),
            Err(AccessError::InvalidKeyIndex(0x1000))
        );
    }

    #[test]
    fn test_transition_time() {
        let t = TransitionTime::from_duration(Duration::from_millis(2500));
        assert_eq!(t.resolution, StepResolution::HundredMillis);
        assert_eq!(t.steps, 25);
        assert_eq!(t.to_byte(), 0x19);

        let t = TransitionTime::from_duration(Duration::from_secs(30));
        assert_eq!(t.resolution, StepResolution::Second);
        assert_eq!(t.duration(), Some(Duration::from_secs(30)));

        let t = TransitionTime::from_duration(Duration::from_secs(3600));
        assert_eq!(t.resolution, StepResolution::TenMinutes);
        assert_eq!(t.steps, 6);
        assert_eq!(TransitionTime::from_byte(t.to_byte()), t);

        assert_eq!(TransitionTime::from_byte(0x3F).duration(), None);
        assert_eq!(TransitionTime::from_byte(0x81).duration(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_composition_page_zero() {
        let raw = hex::decode("0c001a00010008000300000002010000001059000000").unwrap();
        let comp = CompositionData::decode(&raw).unwrap();
        assert_eq!(comp.company_id, 0x000C);
        assert_eq!(comp.product_id, 0x001A);
        assert_eq!(comp.crpl, 0x0008);
        assert_eq!(comp.features, Features::RELAY | Features::PROXY);
        assert_eq!(comp.elements.len(), 1);
        assert_eq!(
            comp.elements[0].models,
            vec![
                ModelIdentifier::CONFIG_SERVER,
                ModelIdentifier::GENERIC_ONOFF_SERVER,
                ModelIdentifier::Vendor {
                    company_id: 0x0059,
                    model_id: 0x0000,
                },
            ]
        );

        let mut buf = BytesMut::new();
        comp.encode(&mut buf);
        assert_eq!(buf.as_ref(), raw.as_slice());

        assert!(CompositionData::decode(&raw[..9]).is_err());
        assert!(CompositionData::decode(&raw[..raw.len() - 1]).is_err());
    }

    #[test]
    fn test_model_identifier() {
        let vendor = ModelIdentifier::decode(&[0x59, 0x00, 0x01, 0x00]).unwrap();
        assert_eq!(vendor.id(), 0x0059_0001);
        assert_eq!(ModelIdentifier::decode(&[0x00, 0x10]), Some(ModelIdentifier::GENERIC_ONOFF_SERVER));
        assert_eq!(ModelIdentifier::decode(&[0x00]), None);
    }
}
