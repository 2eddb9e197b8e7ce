//! Provisioning protocol PDUs.
//!
//! Each PDU is a type byte (top two bits zero) followed by fixed-size,
//! big-endian parameters.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ensure_len;
use crate::WireError;

/// Size of a provisioning public key (X ‖ Y)
pub const PROVISIONING_PUBLIC_KEY_SIZE: usize = 64;
/// Size of confirmation and random values
pub const PROVISIONING_VALUE_SIZE: usize = 16;
/// Cleartext provisioning data size
pub const PROVISIONING_DATA_SIZE: usize = 25;
/// MIC appended to the provisioning data
pub const PROVISIONING_DATA_MIC_SIZE: usize = 8;
/// Capabilities parameter size
pub const CAPABILITIES_SIZE: usize = 11;
/// Start parameter size
pub const START_SIZE: usize = 5;

/// Provisioning PDU type codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningPduType {
    /// Provisioning Invite
    Invite = 0x00,
    /// Provisioning Capabilities
    Capabilities = 0x01,
    /// Provisioning Start
    Start = 0x02,
    /// Provisioning Public Key
    PublicKey = 0x03,
    /// Provisioning Input Complete
    InputComplete = 0x04,
    /// Provisioning Confirmation
    Confirmation = 0x05,
    /// Provisioning Random
    Random = 0x06,
    /// Provisioning Data
    Data = 0x07,
    /// Provisioning Complete
    Complete = 0x08,
    /// Provisioning Failed
    Failed = 0x09,
}

impl TryFrom<u8> for ProvisioningPduType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value & 0xC0 != 0 {
            return Err(WireError::Reserved);
        }
        match value {
            0x00 => Ok(ProvisioningPduType::Invite),
            0x01 => Ok(ProvisioningPduType::Capabilities),
            0x02 => Ok(ProvisioningPduType::Start),
            0x03 => Ok(ProvisioningPduType::PublicKey),
            0x04 => Ok(ProvisioningPduType::InputComplete),
            0x05 => Ok(ProvisioningPduType::Confirmation),
            0x06 => Ok(ProvisioningPduType::Random),
            0x07 => Ok(ProvisioningPduType::Data),
            0x08 => Ok(ProvisioningPduType::Complete),
            0x09 => Ok(ProvisioningPduType::Failed),
            _ => Err(WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Supported provisioning algorithms
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Algorithms: u16 {
        /// FIPS P-256 elliptic curve
        const FIPS_P256 = 1 << 0;
    }
}

bitflags! {
    /// Supported public key delivery types
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PublicKeyType: u8 {
        /// Public key available out of band
        const OOB_AVAILABLE = 1 << 0;
    }
}

bitflags! {
    /// Static OOB availability
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StaticOobType: u8 {
        /// Static OOB information available
        const AVAILABLE = 1 << 0;
    }
}

bitflags! {
    /// Output OOB actions a device supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OutputOobActions: u16 {
        /// Blink
        const BLINK = 1 << 0;
        /// Beep
        const BEEP = 1 << 1;
        /// Vibrate
        const VIBRATE = 1 << 2;
        /// Output numeric
        const NUMERIC = 1 << 3;
        /// Output alphanumeric
        const ALPHANUMERIC = 1 << 4;
    }
}

bitflags! {
    /// Input OOB actions a device supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InputOobActions: u16 {
        /// Push
        const PUSH = 1 << 0;
        /// Twist
        const TWIST = 1 << 1;
        /// Input numeric
        const NUMERIC = 1 << 2;
        /// Input alphanumeric
        const ALPHANUMERIC = 1 << 3;
    }
}

/// Provisioning Capabilities parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Number of elements on the device
    pub num_elements: u8,
    /// Supported algorithms
    pub algorithms: Algorithms,
    /// Supported public key types
    pub public_key_type: PublicKeyType,
    /// Static OOB availability
    pub static_oob_type: StaticOobType,
    /// Maximum output OOB size (0 = not supported)
    pub output_oob_size: u8,
    /// Supported output OOB actions
    pub output_oob_actions: OutputOobActions,
    /// Maximum input OOB size (0 = not supported)
    pub input_oob_size: u8,
    /// Supported input OOB actions
    pub input_oob_actions: InputOobActions,
}

impl Capabilities {
    /// A one-element device with no OOB support
    pub fn no_oob(num_elements: u8) -> Self {
        Self {
            num_elements,
            algorithms: Algorithms::FIPS_P256,
            public_key_type: PublicKeyType::empty(),
            static_oob_type: StaticOobType::empty(),
            output_oob_size: 0,
            output_oob_actions: OutputOobActions::empty(),
            input_oob_size: 0,
            input_oob_actions: InputOobActions::empty(),
        }
    }

    /// Encode the 11-byte parameter block
    pub fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(self.num_elements);
        buf.put_u16(self.algorithms.bits());
        buf.put_u8(self.public_key_type.bits());
        buf.put_u8(self.static_oob_type.bits());
        buf.put_u8(self.output_oob_size);
        buf.put_u16(self.output_oob_actions.bits());
        buf.put_u8(self.input_oob_size);
        buf.put_u16(self.input_oob_actions.bits());
    }

    fn decode_value(mut buf: &[u8]) -> Result<Self, WireError> {
        let num_elements = buf.get_u8();
        if num_elements == 0 {
            return Err(WireError::Malformed);
        }
        Ok(Self {
            num_elements,
            algorithms: Algorithms::from_bits_retain(buf.get_u16()),
            public_key_type: PublicKeyType::from_bits_retain(buf.get_u8()),
            static_oob_type: StaticOobType::from_bits_retain(buf.get_u8()),
            output_oob_size: buf.get_u8(),
            output_oob_actions: OutputOobActions::from_bits_retain(buf.get_u16()),
            input_oob_size: buf.get_u8(),
            input_oob_actions: InputOobActions::from_bits_retain(buf.get_u16()),
        })
    }
}

/// Authentication method chosen in Provisioning Start
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMethod {
    /// No OOB authentication
    NoOob = 0x00,
    /// Static OOB value
    StaticOob = 0x01,
    /// Device outputs, provisioner inputs
    OutputOob = 0x02,
    /// Provisioner outputs, device inputs
    InputOob = 0x03,
}

impl TryFrom<u8> for AuthMethod {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AuthMethod::NoOob),
            0x01 => Ok(AuthMethod::StaticOob),
            0x02 => Ok(AuthMethod::OutputOob),
            0x03 => Ok(AuthMethod::InputOob),
            _ => Err(WireError::Type(value)),
        }
    }
}

/// Provisioning Start parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParameters {
    /// Chosen algorithm (0 = FIPS P-256)
    pub algorithm: u8,
    /// Public key delivery (0 = in band)
    pub public_key: u8,
    /// Authentication method
    pub auth_method: AuthMethod,
    /// Action index within the chosen OOB action set
    pub auth_action: u8,
    /// Number of digits or characters in the OOB value
    pub auth_size: u8,
}

impl StartParameters {
    /// Start with No OOB authentication
    pub fn no_oob() -> Self {
        Self {
            algorithm: 0,
            public_key: 0,
            auth_method: AuthMethod::NoOob,
            auth_action: 0,
            auth_size: 0,
        }
    }

    /// Encode the 5-byte parameter block
    pub fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(self.algorithm);
        buf.put_u8(self.public_key);
        buf.put_u8(self.auth_method as u8);
        buf.put_u8(self.auth_action);
        buf.put_u8(self.auth_size);
    }

    fn decode_value(mut buf: &[u8]) -> Result<Self, WireError> {
        let algorithm = buf.get_u8();
        let public_key = buf.get_u8();
        if algorithm != 0 || public_key > 1 {
            return Err(WireError::Malformed);
        }
        let auth_method = AuthMethod::try_from(buf.get_u8())?;
        let auth_action = buf.get_u8();
        let auth_size = buf.get_u8();
        if auth_method == AuthMethod::NoOob && (auth_action != 0 || auth_size != 0) {
            return Err(WireError::Malformed);
        }
        Ok(Self {
            algorithm,
            public_key,
            auth_method,
            auth_action,
            auth_size,
        })
    }
}

/// Provisioning failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    /// 0x00, prohibited
    Prohibited,
    /// 0x01, unknown or malformed PDU
    InvalidPdu,
    /// 0x02, parameters out of range
    InvalidFormat,
    /// 0x03, PDU not expected in this state
    UnexpectedPdu,
    /// 0x04, confirmation value mismatch
    ConfirmationFailed,
    /// 0x05, device out of resources
    OutOfResources,
    /// 0x06, provisioning data did not decrypt
    DecryptionFailed,
    /// 0x07, unexpected error
    UnexpectedError,
    /// 0x08, addresses could not be assigned
    CannotAssignAddresses,
    /// Any other (RFU) value
    Other(u8),
}

impl FailureCode {
    /// Numeric failure code
    pub fn code(self) -> u8 {
        match self {
            FailureCode::Prohibited => 0x00,
            FailureCode::InvalidPdu => 0x01,
            FailureCode::InvalidFormat => 0x02,
            FailureCode::UnexpectedPdu => 0x03,
            FailureCode::ConfirmationFailed => 0x04,
            FailureCode::OutOfResources => 0x05,
            FailureCode::DecryptionFailed => 0x06,
            FailureCode::UnexpectedError => 0x07,
            FailureCode::CannotAssignAddresses => 0x08,
            FailureCode::Other(code) => code,
        }
    }
}

impl From<u8> for FailureCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => FailureCode::Prohibited,
            0x01 => FailureCode::InvalidPdu,
            0x02 => FailureCode::InvalidFormat,
            0x03 => FailureCode::UnexpectedPdu,
            0x04 => FailureCode::ConfirmationFailed,
            0x05 => FailureCode::OutOfResources,
            0x06 => FailureCode::DecryptionFailed,
            0x07 => FailureCode::UnexpectedError,
            0x08 => FailureCode::CannotAssignAddresses,
            other => FailureCode::Other(other),
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::Other(code) => write!(f, "rfu failure code {:#04x}", code),
            known => write!(f, "{:?}", known),
        }
    }
}

/// The provisioning data carried (encrypted) in the Data PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningData {
    /// Network key
    pub network_key: [u8; 16],
    /// Network key index
    pub key_index: u16,
    /// Bit 0 key refresh, bit 1 IV update
    pub flags: u8,
    /// Current IV index
    pub iv_index: u32,
    /// Primary element unicast address
    pub unicast_address: u16,
}

impl ProvisioningData {
    /// Serialize the 25-byte cleartext
    pub fn encode(&self) -> [u8; PROVISIONING_DATA_SIZE] {
        let mut out = [0u8; PROVISIONING_DATA_SIZE];
        out[..16].copy_from_slice(&self.network_key);
        out[16..18].copy_from_slice(&self.key_index.to_be_bytes());
        out[18] = self.flags;
        out[19..23].copy_from_slice(&self.iv_index.to_be_bytes());
        out[23..25].copy_from_slice(&self.unicast_address.to_be_bytes());
        out
    }

    /// Parse the 25-byte cleartext
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != PROVISIONING_DATA_SIZE {
            return Err(WireError::Length {
                expected: PROVISIONING_DATA_SIZE,
                got: bytes.len(),
            });
        }
        let mut network_key = [0u8; 16];
        network_key.copy_from_slice(&bytes[..16]);
        let mut rest = &bytes[16..];
        let key_index = rest.get_u16();
        if key_index > 0x0FFF {
            return Err(WireError::Reserved);
        }
        Ok(Self {
            network_key,
            key_index,
            flags: rest.get_u8(),
            iv_index: rest.get_u32(),
            unicast_address: rest.get_u16(),
        })
    }
}

/// A provisioning protocol PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningPdu {
    /// Invite with attention timer seconds
    Invite {
        /// Attention timer duration in seconds
        attention_duration: u8,
    },
    /// Device capabilities
    Capabilities(Capabilities),
    /// Chosen algorithm and authentication
    Start(StartParameters),
    /// Public key `X ‖ Y`
    PublicKey(Box<[u8; PROVISIONING_PUBLIC_KEY_SIZE]>),
    /// Device finished entering the input OOB value
    InputComplete,
    /// Confirmation value
    Confirmation([u8; PROVISIONING_VALUE_SIZE]),
    /// Random value
    Random([u8; PROVISIONING_VALUE_SIZE]),
    /// Encrypted provisioning data followed by its MIC
    Data(Bytes),
    /// Provisioning complete
    Complete,
    /// Provisioning failed
    Failed(FailureCode),
}

impl ProvisioningPdu {
    /// The PDU type code
    pub fn pdu_type(&self) -> ProvisioningPduType {
        match self {
            ProvisioningPdu::Invite { .. } => ProvisioningPduType::Invite,
            ProvisioningPdu::Capabilities(_) => ProvisioningPduType::Capabilities,
            ProvisioningPdu::Start(_) => ProvisioningPduType::Start,
            ProvisioningPdu::PublicKey(_) => ProvisioningPduType::PublicKey,
            ProvisioningPdu::InputComplete => ProvisioningPduType::InputComplete,
            ProvisioningPdu::Confirmation(_) => ProvisioningPduType::Confirmation,
            ProvisioningPdu::Random(_) => ProvisioningPduType::Random,
            ProvisioningPdu::Data(_) => ProvisioningPduType::Data,
            ProvisioningPdu::Complete => ProvisioningPduType::Complete,
            ProvisioningPdu::Failed(_) => ProvisioningPduType::Failed,
        }
    }

    /// The parameter bytes (everything after the type byte)
    pub fn encode_value(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PROVISIONING_PUBLIC_KEY_SIZE);
        match self {
            ProvisioningPdu::Invite { attention_duration } => buf.put_u8(*attention_duration),
            ProvisioningPdu::Capabilities(caps) => caps.encode_value(&mut buf),
            ProvisioningPdu::Start(start) => start.encode_value(&mut buf),
            ProvisioningPdu::PublicKey(key) => buf.put_slice(key.as_ref()),
            ProvisioningPdu::Confirmation(value) | ProvisioningPdu::Random(value) => {
                buf.put_slice(value)
            }
            ProvisioningPdu::Data(data) => buf.put_slice(data),
            ProvisioningPdu::Failed(code) => buf.put_u8(code.code()),
            ProvisioningPdu::InputComplete | ProvisioningPdu::Complete => {}
        }
        buf.freeze()
    }

    /// Serialize type byte and parameters
    pub fn encode(&self) -> Bytes {
        let value = self.encode_value();
        let mut buf = BytesMut::with_capacity(1 + value.len());
        buf.put_u8(self.pdu_type() as u8);
        buf.put_slice(&value);
        buf.freeze()
    }

    /// Parse a provisioning PDU
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes.len(), 1)?;
        let pdu_type = ProvisioningPduType::try_from(bytes[0])?;
        let value = &bytes[1..];

        let expected = match pdu_type {
            ProvisioningPduType::Invite | ProvisioningPduType::Failed => 1,
            ProvisioningPduType::Capabilities => CAPABILITIES_SIZE,
            ProvisioningPduType::Start => START_SIZE,
            ProvisioningPduType::PublicKey => PROVISIONING_PUBLIC_KEY_SIZE,
            ProvisioningPduType::Confirmation | ProvisioningPduType::Random => {
                PROVISIONING_VALUE_SIZE
            }
            ProvisioningPduType::Data => PROVISIONING_DATA_SIZE + PROVISIONING_DATA_MIC_SIZE,
            ProvisioningPduType::InputComplete | ProvisioningPduType::Complete => 0,
        };
        if value.len() != expected {
            return Err(WireError::Length {
                expected,
                got: value.len(),
            });
        }

        let pdu = match pdu_type {
            ProvisioningPduType::Invite => ProvisioningPdu::Invite {
                attention_duration: value[0],
            },
            ProvisioningPduType::Capabilities => {
                ProvisioningPdu::Capabilities(Capabilities::decode_value(value)?)
            }
            ProvisioningPduType::Start => ProvisioningPdu::Start(StartParameters::decode_value(value)?),
            ProvisioningPduType::PublicKey => {
                let mut key = [0u8; PROVISIONING_PUBLIC_KEY_SIZE];
                key.copy_from_slice(value);
                ProvisioningPdu::PublicKey(Box::new(key))
            }
            ProvisioningPduType::InputComplete => ProvisioningPdu::InputComplete,
            ProvisioningPduType::Confirmation => ProvisioningPdu::Confirmation(to_value(value)),
            ProvisioningPduType::Random => ProvisioningPdu::Random(to_value(value)),
            ProvisioningPduType::Data => ProvisioningPdu::Data(Bytes::copy_from_slice(value)),
            ProvisioningPduType::Complete => ProvisioningPdu::Complete,
            ProvisioningPduType::Failed => ProvisioningPdu::Failed(FailureCode::from(value[0])),
        };
        Ok(pdu)
    }
}

fn to_value(bytes: &[u8]) -> [u8; PROVISIONING_VALUE_SIZE] {
    let mut out = [0u8; PROVISIONING_VALUE_SIZE];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_byte_validation() {
        assert_eq!(ProvisioningPduType::try_from(0x07).unwrap(), ProvisioningPduType::Data);
        assert_eq!(ProvisioningPduType::try_from(0x0A), Err(WireError::Type(0x0A)));
        assert_eq!(ProvisioningPduType::try_from(0x41), Err(WireError::Reserved));
    }

    #[test]
    fn test_capabilities_layout() {
        let caps = Capabilities {
            num_elements: 2,
            algorithms: Algorithms::FIPS_P256,
            public_key_type: PublicKeyType::empty(),
            static_oob_type: StaticOobType::AVAILABLE,
            output_oob_size: 4,
            output_oob_actions: OutputOobActions::BLINK | OutputOobActions::NUMERIC,
            input_oob_size: 0,
            input_oob_actions: InputOobActions::empty(),
        };
        let bytes = ProvisioningPdu::Capabilities(caps).encode();
        assert_eq!(
            bytes.as_ref(),
            &[0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0x04, 0x00, 0x09, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            ProvisioningPdu::decode(&bytes).unwrap(),
            ProvisioningPdu::Capabilities(caps)
        );
    }

    #[test]
    fn test_start_validation() {
        let start = ProvisioningPdu::Start(StartParameters::no_oob());
        assert_eq!(start.encode().as_ref(), &[0x02, 0, 0, 0, 0, 0]);
        assert!(ProvisioningPdu::decode(&[0x02, 0x01, 0, 0, 0, 0]).is_err());
        assert!(ProvisioningPdu::decode(&[0x02, 0, 0, 0x00, 0x01, 0]).is_err());
        assert_eq!(
            ProvisioningPdu::decode(&[0x02, 0, 0, 0x05, 0, 0]),
            Err(WireError::Type(0x05))
        );
    }

    #[test]
    fn test_length_checks() {
        assert_eq!(
            ProvisioningPdu::decode(&[0x05, 1, 2, 3]),
            Err(WireError::Length { expected: 16, got: 3 })
        );
        assert!(ProvisioningPdu::decode(&[0x08, 0x00]).is_err());
        assert!(ProvisioningPdu::decode(&[]).is_err());
    }

    #[test]
    fn test_public_key_and_failed() {
        let pdu = ProvisioningPdu::PublicKey(Box::new([0xAB; 64]));
        let bytes = pdu.encode();
        assert_eq!(bytes.len(), 65);
        assert_eq!(ProvisioningPdu::decode(&bytes).unwrap(), pdu);

        let failed = ProvisioningPdu::decode(&[0x09, 0x04]).unwrap();
        assert_eq!(failed, ProvisioningPdu::Failed(FailureCode::ConfirmationFailed));
        assert_eq!(
            ProvisioningPdu::decode(&[0x09, 0x20]).unwrap(),
            ProvisioningPdu::Failed(FailureCode::Other(0x20))
        );
        assert_eq!(FailureCode::from(0x08).code(), 0x08);
    }

    #[test]
    fn test_provisioning_data_layout() {
        let data = ProvisioningData {
            network_key: [0x11; 16],
            key_index: 0x0123,
            flags: 0x02,
            iv_index: 0x1234_5678,
            unicast_address: 0x0B0C,
        };
        let bytes = data.encode();
        assert_eq!(&bytes[16..], &[0x01, 0x23, 0x02, 0x12, 0x34, 0x56, 0x78, 0x0B, 0x0C]);
        assert_eq!(ProvisioningData::decode(&bytes).unwrap(), data);

        let mut bad = bytes;
        bad[16] = 0x10;
        assert_eq!(ProvisioningData::decode(&bad), Err(WireError::Reserved));
    }
}
