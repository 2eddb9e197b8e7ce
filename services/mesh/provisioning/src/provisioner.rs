//! Provisioner side of the provisioning protocol.

use bytes::{Bytes, BytesMut};
use mesh_crypto::{aes_ccm_encrypt, Key128, MicSize};
use mesh_transport::{ProvisionedNode, MAX_UNICAST_ADDRESS};
use mesh_wire::{
    is_unicast, AuthMethod, Capabilities, ProvisioningData, ProvisioningPdu, StartParameters,
};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{select_auth, OobValueKind};
use crate::handshake::Handshake;
use crate::{
    AuthValue, ProvisioningConfig, ProvisioningError, ProvisioningEvent, ProvisioningState,
};

/// The unprovisioned device being provisioned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// UUID from the unprovisioned device beacon
    pub uuid: Uuid,
    /// Name given to the resulting node
    pub name: String,
}

/// What the device receives in the Data PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningParameters {
    /// Network key handed to the device
    pub network_key: Key128,
    /// Index of that network key
    pub key_index: u16,
    /// Key refresh and IV update flags
    pub flags: u8,
    /// Current IV index
    pub iv_index: u32,
    /// Primary address; `None` asks for one once the element count is known
    pub unicast_address: Option<u16>,
}

/// Sans-IO provisioner for one device
///
/// Feed received PDUs to [`receive`](Self::receive) and drain
/// [`poll_event`](Self::poll_event) after every call. Protocol failures are
/// reported as [`ProvisioningEvent::Failed`]; method errors only signal
/// misuse such as input after a terminal state.
pub struct Provisioner {
    config: ProvisioningConfig,
    device: DeviceDescriptor,
    params: ProvisioningParameters,
    state: ProvisioningState,
    handshake: Handshake,
    capabilities: Option<Capabilities>,
    start: Option<StartParameters>,
    device_key: Option<Key128>,
    deadline: Option<Instant>,
    events: VecDeque<ProvisioningEvent>,
}

impl Provisioner {
    /// Create a provisioner in `Idle`
    pub fn new(
        config: ProvisioningConfig,
        device: DeviceDescriptor,
        params: ProvisioningParameters,
    ) -> Self {
        Self {
            config,
            device,
            params,
            state: ProvisioningState::Idle,
            handshake: Handshake::new(),
            capabilities: None,
            start: None,
            device_key: None,
            deadline: None,
            events: VecDeque::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Device being provisioned
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Capabilities reported by the device, once received
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    /// Next pending event
    pub fn poll_event(&mut self) -> Option<ProvisioningEvent> {
        self.events.pop_front()
    }

    /// Take every pending event
    pub fn drain_events(&mut self) -> Vec<ProvisioningEvent> {
        self.events.drain(..).collect()
    }

    /// When the attempt times out if nothing arrives
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail the attempt once its deadline has passed
    pub fn handle_timeout(&mut self, now: Instant) {
        if matches!(self.deadline, Some(deadline) if deadline <= now) {
            warn!("provisioning {} timed out in {}", self.device.uuid, self.state);
            self.fail(ProvisioningError::Timeout);
        }
    }

    /// Send the Invite
    pub fn start(&mut self, now: Instant) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::Idle {
            return Err(ProvisioningError::InvalidState(self.state));
        }
        let attention_duration = self.config.attention_duration;
        info!(
            "provisioning {} ({}), attention {}s",
            self.device.name, self.device.uuid, attention_duration
        );
        self.handshake.record(&[attention_duration]);
        self.transmit(ProvisioningPdu::Invite { attention_duration });
        self.touch(now);
        self.transition(ProvisioningState::Invite);
        Ok(())
    }

    /// Supply the unicast address after [`ProvisioningEvent::AddressRequired`]
    pub fn assign_address(&mut self, now: Instant, address: u16) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::Capabilities || self.start.is_some() {
            return Err(ProvisioningError::InvalidState(self.state));
        }
        self.params.unicast_address = Some(address);
        self.touch(now);
        if let Err(e) = self.send_start() {
            self.fail(e);
        }
        Ok(())
    }

    /// Enter the value the device output
    ///
    /// A value that does not parse leaves the state unchanged so the user can
    /// try again.
    pub fn set_auth_value(&mut self, now: Instant, input: &str) -> Result<(), ProvisioningError> {
        let start = match self.start {
            Some(start)
                if self.state == ProvisioningState::Authentication
                    && start.auth_method == AuthMethod::OutputOob =>
            {
                start
            }
            _ => return Err(ProvisioningError::InvalidState(self.state)),
        };
        let kind = OobValueKind::for_start(&start).unwrap_or(OobValueKind::Numeric);
        let value = kind.parse(start.auth_size, input)?;
        self.handshake.set_auth(value);
        self.touch(now);
        self.send_confirmation();
        Ok(())
    }

    /// Abandon the attempt
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            info!("provisioning {} aborted in {}", self.device.uuid, self.state);
            self.fail(ProvisioningError::Cancelled);
        }
    }

    /// Handle one provisioning PDU from the device
    pub fn receive(&mut self, now: Instant, bytes: &[u8]) -> Result<(), ProvisioningError> {
        if self.state.is_terminal() {
            return Err(ProvisioningError::InvalidState(self.state));
        }
        let result = ProvisioningPdu::decode(bytes)
            .map_err(ProvisioningError::from)
            .and_then(|pdu| {
                debug!("rx {:?} in {}", pdu.pdu_type(), self.state);
                self.touch(now);
                self.handle_pdu(pdu)
            });
        if let Err(e) = result {
            self.fail(e);
        }
        Ok(())
    }

    fn handle_pdu(&mut self, pdu: ProvisioningPdu) -> Result<(), ProvisioningError> {
        let input_oob = self.start.map(|s| s.auth_method) == Some(AuthMethod::InputOob);
        match (self.state, pdu) {
            (_, ProvisioningPdu::Failed(code)) => Err(ProvisioningError::Remote(code)),
            (ProvisioningState::Invite, ProvisioningPdu::Capabilities(caps)) => {
                self.on_capabilities(caps)
            }
            (ProvisioningState::PublicKeyExchange, ProvisioningPdu::PublicKey(key)) => {
                self.on_public_key(&key)
            }
            (ProvisioningState::Authentication, ProvisioningPdu::InputComplete) if input_oob => {
                self.send_confirmation();
                Ok(())
            }
            (ProvisioningState::Confirmation, ProvisioningPdu::Confirmation(value)) => {
                self.handshake.record_peer_confirmation(value)?;
                self.transmit(ProvisioningPdu::Random(*self.handshake.random()));
                self.transition(ProvisioningState::RandomExchange);
                Ok(())
            }
            (ProvisioningState::RandomExchange, ProvisioningPdu::Random(value)) => {
                self.on_random(value)
            }
            (ProvisioningState::ProvisioningDataExchange, ProvisioningPdu::Complete) => {
                self.on_complete()
            }
            (state, pdu) => Err(ProvisioningError::UnexpectedPdu {
                state,
                pdu: pdu.pdu_type(),
            }),
        }
    }

    fn on_capabilities(&mut self, caps: Capabilities) -> Result<(), ProvisioningError> {
        let mut value = BytesMut::new();
        caps.encode_value(&mut value);
        self.handshake.record(&value);
        self.capabilities = Some(caps);
        self.events
            .push_back(ProvisioningEvent::CapabilitiesReceived(caps));
        self.transition(ProvisioningState::Capabilities);

        if self.params.unicast_address.is_some() {
            self.send_start()
        } else {
            self.events.push_back(ProvisioningEvent::AddressRequired {
                element_count: caps.num_elements,
            });
            Ok(())
        }
    }

    fn send_start(&mut self) -> Result<(), ProvisioningError> {
        let caps = self
            .capabilities
            .ok_or(ProvisioningError::InvalidState(self.state))?;
        let address = self.params.unicast_address.unwrap_or(0);
        let last = address as u32 + caps.num_elements as u32 - 1;
        if !is_unicast(address) || last > MAX_UNICAST_ADDRESS as u32 {
            return Err(ProvisioningError::CannotAssignAddresses(caps.num_elements));
        }

        let start = select_auth(&caps, &self.config);
        debug!(
            "auth {:?} action {} size {}",
            start.auth_method, start.auth_action, start.auth_size
        );
        let mut value = BytesMut::new();
        start.encode_value(&mut value);
        self.handshake.record(&value);
        self.start = Some(start);

        self.transmit(ProvisioningPdu::Start(start));
        self.transmit(ProvisioningPdu::PublicKey(Box::new(*self.handshake.public_key())));
        self.transition(ProvisioningState::PublicKeyExchange);
        Ok(())
    }

    fn on_public_key(&mut self, device_key: &[u8; 64]) -> Result<(), ProvisioningError> {
        let own = *self.handshake.public_key();
        self.handshake.agree(&own, device_key)?;

        let start = self.start.ok_or(ProvisioningError::InvalidState(self.state))?;
        match start.auth_method {
            AuthMethod::NoOob => self.send_confirmation(),
            AuthMethod::StaticOob => {
                let key = self
                    .config
                    .static_oob
                    .ok_or(ProvisioningError::Unsupported("static oob"))?;
                self.handshake.set_auth(AuthValue::from_static(key));
                self.send_confirmation();
            }
            AuthMethod::OutputOob => {
                self.transition(ProvisioningState::Authentication);
                self.events.push_back(ProvisioningEvent::AuthValueRequired {
                    method: start.auth_method,
                    action: start.auth_action,
                    size: start.auth_size,
                });
            }
            AuthMethod::InputOob => {
                let kind = OobValueKind::for_start(&start).unwrap_or(OobValueKind::Numeric);
                let (value, text) = kind.generate(start.auth_size);
                self.handshake.set_auth(value);
                self.transition(ProvisioningState::Authentication);
                self.events.push_back(ProvisioningEvent::DisplayAuthValue(text));
            }
        }
        Ok(())
    }

    fn send_confirmation(&mut self) {
        let value = self.handshake.confirmation();
        self.transmit(ProvisioningPdu::Confirmation(value));
        self.transition(ProvisioningState::Confirmation);
    }

    fn on_random(&mut self, device_random: [u8; 16]) -> Result<(), ProvisioningError> {
        self.handshake.verify_peer(&device_random)?;
        let keys = self
            .handshake
            .session_keys(self.handshake.random(), &device_random)?;

        let data = ProvisioningData {
            network_key: self.params.network_key,
            key_index: self.params.key_index,
            flags: self.params.flags,
            iv_index: self.params.iv_index,
            unicast_address: self.params.unicast_address.unwrap_or(0),
        };
        let sealed = aes_ccm_encrypt(
            &keys.session_key,
            &keys.session_nonce,
            &data.encode(),
            &[],
            MicSize::Big,
        )?;
        self.device_key = Some(keys.device_key);
        self.transmit(ProvisioningPdu::Data(Bytes::from(sealed)));
        self.transition(ProvisioningState::ProvisioningDataExchange);
        Ok(())
    }

    fn on_complete(&mut self) -> Result<(), ProvisioningError> {
        let device_key = self
            .device_key
            .ok_or(ProvisioningError::InvalidState(self.state))?;
        let element_count = self.capabilities.map(|c| c.num_elements).unwrap_or(1);
        let unicast_address = self.params.unicast_address.unwrap_or(0);
        let node = ProvisionedNode::new(
            self.device.name.clone(),
            self.device.uuid,
            unicast_address,
            element_count,
            self.params.key_index,
            device_key,
        );
        info!(
            "provisioned {} at {:#06x} ({} elements)",
            self.device.uuid, unicast_address, element_count
        );
        self.deadline = None;
        self.transition(ProvisioningState::Complete);
        self.events.push_back(ProvisioningEvent::NodeProvisioned(node));
        Ok(())
    }

    fn transmit(&mut self, pdu: ProvisioningPdu) {
        self.events.push_back(ProvisioningEvent::Transmit(pdu.encode()));
    }

    fn transition(&mut self, state: ProvisioningState) {
        self.state = state;
        self.events.push_back(ProvisioningEvent::StateChanged(state));
    }

    fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.config.timeout);
    }

    fn fail(&mut self, error: ProvisioningError) {
        warn!("provisioning {} failed: {}", self.device.uuid, error);
        self.deadline = None;
        self.transition(ProvisioningState::Failed);
        self.events.push_back(ProvisioningEvent::Failed(error));
    }
}
