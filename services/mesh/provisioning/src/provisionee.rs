//! Device side of the provisioning protocol.
//!
//! Used by in-process devices and tests. Unlike the provisioner, the device
//! reports every local failure to the peer with a Failed PDU.

use bytes::BytesMut;
use mesh_crypto::{aes_ccm_decrypt, Key128, MicSize};
use mesh_wire::{AuthMethod, Capabilities, ProvisioningData, ProvisioningPdu, StartParameters};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::auth::{validate_start, OobValueKind};
use crate::handshake::Handshake;
use crate::{AuthValue, ProvisioningError, ProvisioningEvent, ProvisioningState};

/// Sans-IO device role
pub struct Provisionee {
    capabilities: Capabilities,
    static_oob: Option<Key128>,
    state: ProvisioningState,
    handshake: Handshake,
    start: Option<StartParameters>,
    provisioner_random: Option<[u8; 16]>,
    events: VecDeque<ProvisioningEvent>,
}

impl Provisionee {
    /// A device advertising `capabilities`, with an optional static OOB value
    pub fn new(capabilities: Capabilities, static_oob: Option<Key128>) -> Self {
        Self {
            capabilities,
            static_oob,
            state: ProvisioningState::Idle,
            handshake: Handshake::new(),
            start: None,
            provisioner_random: None,
            events: VecDeque::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Next pending event
    pub fn poll_event(&mut self) -> Option<ProvisioningEvent> {
        self.events.pop_front()
    }

    /// Take every pending event
    pub fn drain_events(&mut self) -> Vec<ProvisioningEvent> {
        self.events.drain(..).collect()
    }

    /// Enter the value the provisioner displayed (input OOB)
    pub fn set_auth_value(&mut self, input: &str) -> Result<(), ProvisioningError> {
        let start = match self.start {
            Some(start)
                if self.state == ProvisioningState::Authentication
                    && start.auth_method == AuthMethod::InputOob =>
            {
                start
            }
            _ => return Err(ProvisioningError::InvalidState(self.state)),
        };
        let kind = OobValueKind::for_start(&start).unwrap_or(OobValueKind::Numeric);
        let value = kind.parse(start.auth_size, input)?;
        self.handshake.set_auth(value);
        self.transmit(ProvisioningPdu::InputComplete);
        self.transition(ProvisioningState::Confirmation);
        Ok(())
    }

    /// Handle one provisioning PDU from the provisioner
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), ProvisioningError> {
        if self.state.is_terminal() {
            return Err(ProvisioningError::InvalidState(self.state));
        }
        let result = ProvisioningPdu::decode(bytes)
            .map_err(ProvisioningError::from)
            .and_then(|pdu| {
                debug!("device rx {:?} in {}", pdu.pdu_type(), self.state);
                self.handle_pdu(pdu)
            });
        if let Err(e) = result {
            self.fail(e);
        }
        Ok(())
    }

    fn handle_pdu(&mut self, pdu: ProvisioningPdu) -> Result<(), ProvisioningError> {
        match (self.state, pdu) {
            (_, ProvisioningPdu::Failed(code)) => Err(ProvisioningError::Remote(code)),
            (ProvisioningState::Idle, ProvisioningPdu::Invite { attention_duration }) => {
                info!("invited, attention {}s", attention_duration);
                self.handshake.record(&[attention_duration]);
                let mut value = BytesMut::new();
                self.capabilities.encode_value(&mut value);
                self.handshake.record(&value);
                self.transmit(ProvisioningPdu::Capabilities(self.capabilities));
                self.transition(ProvisioningState::Capabilities);
                Ok(())
            }
            (ProvisioningState::Capabilities, ProvisioningPdu::Start(start)) => {
                validate_start(&self.capabilities, &start)?;
                if start.auth_method == AuthMethod::StaticOob && self.static_oob.is_none() {
                    return Err(ProvisioningError::Unsupported("static oob"));
                }
                let mut value = BytesMut::new();
                start.encode_value(&mut value);
                self.handshake.record(&value);
                self.start = Some(start);
                self.transition(ProvisioningState::PublicKeyExchange);
                Ok(())
            }
            (ProvisioningState::PublicKeyExchange, ProvisioningPdu::PublicKey(key)) => {
                self.on_public_key(&key)
            }
            (ProvisioningState::Confirmation, ProvisioningPdu::Confirmation(value)) => {
                self.handshake.record_peer_confirmation(value)?;
                let own = self.handshake.confirmation();
                self.transmit(ProvisioningPdu::Confirmation(own));
                self.transition(ProvisioningState::RandomExchange);
                Ok(())
            }
            (ProvisioningState::RandomExchange, ProvisioningPdu::Random(value)) => {
                self.handshake.verify_peer(&value)?;
                self.provisioner_random = Some(value);
                self.transmit(ProvisioningPdu::Random(*self.handshake.random()));
                self.transition(ProvisioningState::ProvisioningDataExchange);
                Ok(())
            }
            (ProvisioningState::ProvisioningDataExchange, ProvisioningPdu::Data(sealed)) => {
                self.on_data(&sealed)
            }
            (state, pdu) => Err(ProvisioningError::UnexpectedPdu {
                state,
                pdu: pdu.pdu_type(),
            }),
        }
    }

    fn on_public_key(&mut self, provisioner_key: &[u8; 64]) -> Result<(), ProvisioningError> {
        let own = *self.handshake.public_key();
        self.handshake.agree(provisioner_key, &own)?;
        self.transmit(ProvisioningPdu::PublicKey(Box::new(own)));

        let start = self.start.ok_or(ProvisioningError::InvalidState(self.state))?;
        match start.auth_method {
            AuthMethod::NoOob => {}
            AuthMethod::StaticOob => {
                let key = self
                    .static_oob
                    .ok_or(ProvisioningError::Unsupported("static oob"))?;
                self.handshake.set_auth(AuthValue::from_static(key));
            }
            AuthMethod::OutputOob => {
                let kind = OobValueKind::for_start(&start).unwrap_or(OobValueKind::Numeric);
                let (value, text) = kind.generate(start.auth_size);
                self.handshake.set_auth(value);
                self.events.push_back(ProvisioningEvent::DisplayAuthValue(text));
            }
            AuthMethod::InputOob => {
                self.transition(ProvisioningState::Authentication);
                self.events.push_back(ProvisioningEvent::AuthValueRequired {
                    method: start.auth_method,
                    action: start.auth_action,
                    size: start.auth_size,
                });
                return Ok(());
            }
        }
        self.transition(ProvisioningState::Confirmation);
        Ok(())
    }

    fn on_data(&mut self, sealed: &[u8]) -> Result<(), ProvisioningError> {
        let provisioner_random = self
            .provisioner_random
            .ok_or(ProvisioningError::InvalidState(self.state))?;
        let keys = self
            .handshake
            .session_keys(&provisioner_random, self.handshake.random())?;
        let plain = aes_ccm_decrypt(
            &keys.session_key,
            &keys.session_nonce,
            sealed,
            &[],
            MicSize::Big,
        )
        .map_err(|_| ProvisioningError::DecryptionFailed)?;
        let data = ProvisioningData::decode(&plain)?;

        info!(
            "provisioned as {:#06x}, net key index {}",
            data.unicast_address, data.key_index
        );
        self.transmit(ProvisioningPdu::Complete);
        self.transition(ProvisioningState::Complete);
        self.events.push_back(ProvisioningEvent::DeviceProvisioned {
            data,
            device_key: keys.device_key,
        });
        Ok(())
    }

    fn transmit(&mut self, pdu: ProvisioningPdu) {
        self.events.push_back(ProvisioningEvent::Transmit(pdu.encode()));
    }

    fn transition(&mut self, state: ProvisioningState) {
        self.state = state;
        self.events.push_back(ProvisioningEvent::StateChanged(state));
    }

    fn fail(&mut self, error: ProvisioningError) {
        warn!("device provisioning failed: {}", error);
        if !matches!(error, ProvisioningError::Remote(_)) {
            self.transmit(ProvisioningPdu::Failed(error.failure_code()));
        }
        self.transition(ProvisioningState::Failed);
        self.events.push_back(ProvisioningEvent::Failed(error));
    }
}
