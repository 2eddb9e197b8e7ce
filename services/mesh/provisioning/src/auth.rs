//! OOB authentication values.
//!
//! Every method reduces to a 16-byte AuthValue mixed into the confirmation:
//! zeros for No OOB, the configured key for static OOB, a big-endian number
//! for numeric actions and left-aligned ASCII for alphanumeric ones.

use mesh_crypto::Key128;
use mesh_wire::{AuthMethod, Capabilities, InputOobActions, OutputOobActions, StartParameters};
use rand::Rng;
use std::fmt;

use crate::{ProvisioningConfig, ProvisioningError};

/// Largest OOB size the protocol allows
pub const MAX_OOB_SIZE: u8 = 8;

const ALPHANUMERIC_CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

// Action indexes that carry text instead of a number
const OUTPUT_ALPHANUMERIC: u8 = 4;
const INPUT_ALPHANUMERIC: u8 = 3;

/// The 16-byte value both sides feed into the confirmation
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthValue([u8; 16]);

impl AuthValue {
    /// No OOB
    pub fn zero() -> Self {
        Self([0u8; 16])
    }

    /// Static OOB
    pub fn from_static(key: Key128) -> Self {
        Self(key)
    }

    /// Numeric actions (blink, beep, push, numeric entry, ...)
    pub fn numeric(value: u32) -> Self {
        let mut out = [0u8; 16];
        out[12..].copy_from_slice(&value.to_be_bytes());
        Self(out)
    }

    /// Alphanumeric actions
    pub fn alphanumeric(value: &str) -> Result<Self, ProvisioningError> {
        if value.is_empty()
            || value.len() > MAX_OOB_SIZE as usize
            || !value.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(ProvisioningError::InvalidAuthValue(value.to_string()));
        }
        let mut out = [0u8; 16];
        out[..value.len()].copy_from_slice(value.as_bytes());
        Ok(Self(out))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthValue(..)")
    }
}

/// Whether an OOB value is a number or text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobValueKind {
    /// Decimal number
    Numeric,
    /// ASCII letters and digits
    Alphanumeric,
}

impl OobValueKind {
    /// Kind implied by a Start PDU; `None` for No OOB and static OOB
    pub fn for_start(start: &StartParameters) -> Option<Self> {
        match start.auth_method {
            AuthMethod::OutputOob if start.auth_action == OUTPUT_ALPHANUMERIC => {
                Some(OobValueKind::Alphanumeric)
            }
            AuthMethod::InputOob if start.auth_action == INPUT_ALPHANUMERIC => {
                Some(OobValueKind::Alphanumeric)
            }
            AuthMethod::OutputOob | AuthMethod::InputOob => Some(OobValueKind::Numeric),
            AuthMethod::NoOob | AuthMethod::StaticOob => None,
        }
    }

    /// Parse what the user typed
    pub fn parse(self, size: u8, input: &str) -> Result<AuthValue, ProvisioningError> {
        let input = input.trim();
        if input.is_empty() || input.len() > size as usize {
            return Err(ProvisioningError::InvalidAuthValue(input.to_string()));
        }
        match self {
            OobValueKind::Numeric => input
                .parse::<u32>()
                .map(AuthValue::numeric)
                .map_err(|_| ProvisioningError::InvalidAuthValue(input.to_string())),
            OobValueKind::Alphanumeric => AuthValue::alphanumeric(input),
        }
    }

    /// Generate a value to display, returning it with its text form
    pub fn generate(self, size: u8) -> (AuthValue, String) {
        let size = size.clamp(1, MAX_OOB_SIZE);
        let mut rng = rand::thread_rng();
        match self {
            OobValueKind::Numeric => {
                let value = rng.gen_range(1..10u32.pow(size as u32));
                (AuthValue::numeric(value), value.to_string())
            }
            OobValueKind::Alphanumeric => {
                let text: String = (0..size)
                    .map(|_| {
                        ALPHANUMERIC_CHARSET[rng.gen_range(0..ALPHANUMERIC_CHARSET.len())] as char
                    })
                    .collect();
                (AuthValue(ascii_value(&text)), text)
            }
        }
    }
}

fn ascii_value(text: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let len = text.len().min(16);
    out[..len].copy_from_slice(&text.as_bytes()[..len]);
    out
}

fn lowest_action(bits: u16, preferred: u16) -> Option<u8> {
    if bits & preferred != 0 {
        return Some(preferred.trailing_zeros() as u8);
    }
    (bits != 0).then(|| bits.trailing_zeros() as u8)
}

/// Pick the authentication method for a device's capabilities
///
/// Static OOB wins when both sides have it, then output OOB, then input OOB,
/// falling back to No OOB. Numeric actions are preferred within a method.
pub fn select_auth(capabilities: &Capabilities, config: &ProvisioningConfig) -> StartParameters {
    let static_available = capabilities
        .static_oob_type
        .contains(mesh_wire::StaticOobType::AVAILABLE);
    if static_available && config.static_oob.is_some() {
        return StartParameters {
            auth_method: AuthMethod::StaticOob,
            ..StartParameters::no_oob()
        };
    }

    if config.allow_output_oob && capabilities.output_oob_size > 0 {
        let bits = capabilities.output_oob_actions.bits();
        if let Some(action) = lowest_action(bits, OutputOobActions::NUMERIC.bits()) {
            return StartParameters {
                auth_method: AuthMethod::OutputOob,
                auth_action: action,
                auth_size: capabilities.output_oob_size.min(MAX_OOB_SIZE),
                ..StartParameters::no_oob()
            };
        }
    }

    if config.allow_input_oob && capabilities.input_oob_size > 0 {
        let bits = capabilities.input_oob_actions.bits();
        if let Some(action) = lowest_action(bits, InputOobActions::NUMERIC.bits()) {
            return StartParameters {
                auth_method: AuthMethod::InputOob,
                auth_action: action,
                auth_size: capabilities.input_oob_size.min(MAX_OOB_SIZE),
                ..StartParameters::no_oob()
            };
        }
    }

    StartParameters::no_oob()
}

/// Check that a Start PDU only uses what the device advertised
pub fn validate_start(
    capabilities: &Capabilities,
    start: &StartParameters,
) -> Result<(), ProvisioningError> {
    let supported = match start.auth_method {
        AuthMethod::NoOob => true,
        AuthMethod::StaticOob => capabilities
            .static_oob_type
            .contains(mesh_wire::StaticOobType::AVAILABLE),
        AuthMethod::OutputOob => {
            start.auth_action < 16
                && capabilities.output_oob_actions.bits() & (1 << start.auth_action) != 0
                && (1..=capabilities.output_oob_size).contains(&start.auth_size)
        }
        AuthMethod::InputOob => {
            start.auth_action < 16
                && capabilities.input_oob_actions.bits() & (1 << start.auth_action) != 0
                && (1..=capabilities.input_oob_size).contains(&start.auth_size)
        }
    };
    if supported {
        Ok(())
    } else {
        Err(ProvisioningError::Unsupported("authentication method"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_value_layout() {
        assert_eq!(AuthValue::zero().as_bytes(), &[0u8; 16]);
        let numeric = AuthValue::numeric(0x0001_E240);
        assert_eq!(&numeric.as_bytes()[12..], &[0x00, 0x01, 0xE2, 0x40]);
        assert_eq!(&numeric.as_bytes()[..12], &[0u8; 12]);

        let text = AuthValue::alphanumeric("AB12").unwrap();
        assert_eq!(&text.as_bytes()[..4], b"AB12");
        assert_eq!(&text.as_bytes()[4..], &[0u8; 12]);
        assert!(AuthValue::alphanumeric("no spaces").is_err());
    }

    #[test]
    fn test_parse_respects_size() {
        assert_eq!(
            OobValueKind::Numeric.parse(4, " 1234 ").unwrap(),
            AuthValue::numeric(1234)
        );
        assert!(OobValueKind::Numeric.parse(3, "1234").is_err());
        assert!(OobValueKind::Numeric.parse(4, "12a4").is_err());
        assert!(OobValueKind::Alphanumeric.parse(6, "").is_err());
    }

    #[test]
    fn test_generated_value_parses_back() {
        for kind in [OobValueKind::Numeric, OobValueKind::Alphanumeric] {
            let (value, text) = kind.generate(6);
            assert!(text.len() <= 6);
            assert_eq!(kind.parse(6, &text).unwrap(), value);
        }
    }

    #[test]
    fn test_select_auth_preference() {
        let mut caps = Capabilities::no_oob(1);
        let mut config = ProvisioningConfig::default();
        assert_eq!(select_auth(&caps, &config).auth_method, AuthMethod::NoOob);

        caps.input_oob_size = 4;
        caps.input_oob_actions = InputOobActions::PUSH | InputOobActions::NUMERIC;
        let start = select_auth(&caps, &config);
        assert_eq!(start.auth_method, AuthMethod::InputOob);
        assert_eq!(start.auth_action, 2);

        caps.output_oob_size = 10;
        caps.output_oob_actions = OutputOobActions::BLINK;
        let start = select_auth(&caps, &config);
        assert_eq!(start.auth_method, AuthMethod::OutputOob);
        assert_eq!(start.auth_action, 0);
        assert_eq!(start.auth_size, MAX_OOB_SIZE);

        caps.static_oob_type = mesh_wire::StaticOobType::AVAILABLE;
        assert_eq!(select_auth(&caps, &config).auth_method, AuthMethod::OutputOob);
        config.static_oob = Some([7; 16]);
        assert_eq!(select_auth(&caps, &config).auth_method, AuthMethod::StaticOob);
    }

    #[test]
    fn test_validate_start_against_capabilities() {
        let caps = Capabilities::no_oob(1);
        assert!(validate_start(&caps, &StartParameters::no_oob()).is_ok());
        let start = StartParameters {
            auth_method: AuthMethod::OutputOob,
            auth_action: 3,
            auth_size: 4,
            ..StartParameters::no_oob()
        };
        assert!(validate_start(&caps, &start).is_err());
    }
}
