//! In-process mesh device.
//!
//! [`LoopbackNode`] is the device side of a session: a [`Provisionee`] until
//! provisioning completes, then a node with its own [`NetworkContext`] and
//! [`TransportEngine`] serving a Configuration Server, a Generic OnOff Server
//! and a Generic Level Server. It speaks proxy PDUs, so it can be wired
//! directly to a session's outbound channel and [`MeshHandle::deliver`].

use bytes::{Bytes, BytesMut};
use mesh_access::{
    CompositionData, ConfigAppKeyAdd, ConfigAppKeyStatus, ConfigCompositionDataStatus,
    ConfigModelAppBind, ConfigModelAppStatus, ConfigModelSubscriptionAdd,
    ConfigModelSubscriptionStatus, ConfigStatus, Element, Features, GenericLevelStatus,
    GenericOnOffStatus, MeshMessage, MessageCatalog, ModelIdentifier, StatusEnvelope,
};
use mesh_crypto::Key128;
use mesh_provisioning::{
    DeviceDescriptor, ProvisioningEvent, ProvisioningState, Provisionee,
};
use mesh_transport::{
    AccessKey, ApplicationKey, IncomingAccess, IvIndex, ModelBinding, NetworkContext, NetworkKey,
    OutgoingAccess, Subscription, TransportEngine, TransportOutput,
};
use mesh_wire::{
    Capabilities, MeshAddress, ProvisioningData, ProxyPduType, ProxyReassembler, ProxySegmenter,
    StaticOobType,
};
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{now, sleep_until};
use crate::{MeshError, MeshHandle, SessionConfig};

/// A simulated device answering configuration and generic messages
pub struct LoopbackNode {
    name: String,
    uuid: Uuid,
    composition: CompositionData,
    capabilities: Capabilities,
    static_oob: Option<Key128>,
    provisionee: Provisionee,
    context: Option<NetworkContext>,
    engine: TransportEngine,
    catalog: MessageCatalog,
    reassembler: ProxyReassembler,
    segmenter: ProxySegmenter,
    bindings: Vec<ModelBinding>,
    subscriptions: Vec<Subscription>,
    onoff: bool,
    level: i16,
    reset_requested: bool,
    outbound: VecDeque<Bytes>,
}

impl LoopbackNode {
    /// A device with the given composition and no OOB authentication
    pub fn new(name: impl Into<String>, composition: CompositionData, config: &SessionConfig) -> Result<Self, MeshError> {
        let elements = composition.elements.len().clamp(1, u8::MAX as usize) as u8;
        let capabilities = Capabilities::no_oob(elements);
        Ok(Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            composition,
            provisionee: Provisionee::new(capabilities, None),
            capabilities,
            static_oob: None,
            context: None,
            engine: TransportEngine::new(config.transport.clone()),
            catalog: MessageCatalog::default(),
            reassembler: ProxyReassembler::new(),
            segmenter: ProxySegmenter::new(config.mtu)?,
            bindings: Vec::new(),
            subscriptions: Vec::new(),
            onoff: false,
            level: 0,
            reset_requested: false,
            outbound: VecDeque::new(),
        })
    }

    /// A single-element light with OnOff and Level servers
    pub fn light(name: impl Into<String>, config: &SessionConfig) -> Result<Self, MeshError> {
        Self::new(name, light_composition(), config)
    }

    /// Advertise a static OOB value
    pub fn with_static_oob(mut self, value: Key128) -> Self {
        self.capabilities.static_oob_type = StaticOobType::AVAILABLE;
        self.static_oob = Some(value);
        self.provisionee = Provisionee::new(self.capabilities, self.static_oob);
        self
    }

    /// Use a fixed UUID instead of a random one
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Descriptor to pass to [`MeshHandle::provision`]
    pub fn device(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            uuid: self.uuid,
            name: self.name.clone(),
        }
    }

    /// Provisioning state of the device role
    pub fn provisioning_state(&self) -> ProvisioningState {
        self.provisionee.state()
    }

    /// Primary address once provisioned
    pub fn unicast_address(&self) -> Option<u16> {
        self.context.as_ref().map(|ctx| ctx.unicast_address)
    }

    /// The node's network state once provisioned
    pub fn context(&self) -> Option<&NetworkContext> {
        self.context.as_ref()
    }

    /// Composition data page 0
    pub fn composition(&self) -> &CompositionData {
        &self.composition
    }

    /// Model to application key bindings
    pub fn bindings(&self) -> &[ModelBinding] {
        &self.bindings
    }

    /// Model subscriptions
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Generic OnOff state
    pub fn onoff(&self) -> bool {
        self.onoff
    }

    /// Generic Level state
    pub fn level(&self) -> i16 {
        self.level
    }

    /// Next proxy PDU fragment for the provisioner
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.outbound.pop_front()
    }

    /// Earliest transport timer
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.engine.poll_timeout()
    }

    /// Run due transport timers
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(ctx) = self.context.as_mut() {
            self.engine.handle_timeout(ctx, now);
        }
        self.process(now);
    }

    /// Feed one proxy PDU fragment from the provisioner
    pub fn receive(&mut self, now: Instant, bytes: &[u8]) -> Result<(), MeshError> {
        let result = match self.reassembler.push(bytes) {
            Ok(Some((pdu_type, pdu))) => self.handle_proxy_pdu(now, pdu_type, &pdu),
            Ok(None) => Ok(()),
            Err(e) => {
                self.reassembler.reset();
                Err(e.into())
            }
        };
        self.process(now);
        result
    }

    /// Drive the node from a session's outbound channel until it closes
    ///
    /// Returns the node so its final state can be inspected.
    pub fn spawn(mut self, handle: MeshHandle, mut bearer: mpsc::UnboundedReceiver<Bytes>) -> JoinHandle<Self> {
        tokio::spawn(async move {
            loop {
                let deadline = self.poll_timeout();
                tokio::select! {
                    bytes = bearer.recv() => match bytes {
                        Some(bytes) => {
                            if let Err(e) = self.receive(now(), &bytes) {
                                debug!("{}: pdu dropped: {}", self.name, e);
                            }
                        }
                        None => break,
                    },
                    _ = sleep_until(deadline) => self.handle_timeout(now()),
                }
                while let Some(fragment) = self.poll_transmit() {
                    if handle.deliver(fragment).await.is_err() {
                        return self;
                    }
                }
            }
            self
        })
    }

    fn handle_proxy_pdu(&mut self, now: Instant, pdu_type: ProxyPduType, pdu: &[u8]) -> Result<(), MeshError> {
        match (pdu_type, self.context.as_mut()) {
            (ProxyPduType::Provisioning, _) => Ok(self.provisionee.receive(pdu)?),
            (ProxyPduType::NetworkPdu, Some(ctx)) => {
                Ok(self.engine.receive_network_pdu(ctx, now, pdu)?)
            }
            (ProxyPduType::MeshBeacon, Some(ctx)) => Ok(self.engine.receive_beacon(ctx, pdu)?),
            (pdu_type, _) => {
                debug!("{}: {:?} pdu ignored", self.name, pdu_type);
                Ok(())
            }
        }
    }

    fn transmit(&mut self, pdu_type: ProxyPduType, pdu: &[u8]) {
        self.outbound
            .extend(self.segmenter.segment(pdu_type, pdu));
    }

    fn process(&mut self, now: Instant) {
        while let Some(event) = self.provisionee.poll_event() {
            match event {
                ProvisioningEvent::Transmit(pdu) => self.transmit(ProxyPduType::Provisioning, &pdu),
                ProvisioningEvent::DeviceProvisioned { data, device_key } => {
                    if let Err(e) = self.join(&data, device_key) {
                        warn!("{}: provisioning data rejected: {}", self.name, e);
                    }
                }
                ProvisioningEvent::DisplayAuthValue(value) => {
                    info!("{}: displaying {}", self.name, value);
                }
                ProvisioningEvent::Failed(e) => warn!("{}: provisioning failed: {}", self.name, e),
                other => debug!("{}: {:?}", self.name, other),
            }
        }

        while let Some(output) = self.engine.poll_output() {
            match output {
                TransportOutput::Transmit(pdu) => self.transmit(ProxyPduType::NetworkPdu, &pdu),
                TransportOutput::Access(incoming) => self.serve(now, incoming),
                other => debug!("{}: {:?}", self.name, other),
            }
        }

        if std::mem::take(&mut self.reset_requested) {
            self.forget();
        }
    }

    fn join(&mut self, data: &ProvisioningData, device_key: Key128) -> Result<(), MeshError> {
        let key = NetworkKey::new(data.key_index, &data.network_key)?;
        let mut ctx = NetworkContext::new(self.name.clone(), data.unicast_address, key);
        ctx.element_count = self.capabilities.num_elements;
        ctx.device_key = Some(device_key);
        ctx.iv_index = IvIndex::new(data.iv_index);
        ctx.iv_index.update_active = data.flags & 0x02 != 0;
        info!(
            "{}: joined network at {:#06x} iv_index={}",
            self.name, data.unicast_address, data.iv_index
        );
        self.context = Some(ctx);
        Ok(())
    }

    /// Back to an unprovisioned device
    fn forget(&mut self) {
        info!("{}: node reset", self.name);
        self.engine.cancel_all();
        self.engine.drain_outputs();
        self.context = None;
        self.bindings.clear();
        self.subscriptions.clear();
        self.provisionee = Provisionee::new(self.capabilities, self.static_oob);
    }

    fn serve(&mut self, now: Instant, incoming: IncomingAccess) {
        let message = match self.catalog.decode_pdu(&incoming.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: access message dropped: {}", self.name, e);
                return;
            }
        };
        debug!("{}: rx {} from {:#06x}", self.name, message.name(), incoming.src);
        let Some(response) = self.handle_message(message, incoming.key) else {
            return;
        };
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{}: cannot encode {}: {}", self.name, response.name(), e);
                return;
            }
        };
        let mut outgoing = OutgoingAccess::new(incoming.src, incoming.key, payload);
        if ctx.is_local_address(incoming.dst) {
            outgoing.src = Some(incoming.dst);
        }
        if let Err(e) = self.engine.send_access(ctx, now, outgoing) {
            warn!("{}: {} not sent: {}", self.name, response.name(), e);
        }
    }

    fn handle_message(&mut self, message: MeshMessage, key: AccessKey) -> Option<MeshMessage> {
        let device = key == AccessKey::Device;
        let response = match message {
            MeshMessage::AppKeyAdd(add) if device => MeshMessage::AppKeyStatus(ConfigAppKeyStatus {
                status: StatusEnvelope::new(self.add_app_key(&add)),
                net_key_index: add.net_key_index,
                app_key_index: add.app_key_index,
            }),
            MeshMessage::CompositionDataGet { .. } if device => {
                let mut data = BytesMut::new();
                self.composition.encode(&mut data);
                MeshMessage::CompositionDataStatus(ConfigCompositionDataStatus {
                    page: 0,
                    data: data.freeze(),
                })
            }
            MeshMessage::ModelAppBind(bind) if device => MeshMessage::ModelAppStatus(ConfigModelAppStatus {
                status: StatusEnvelope::new(self.bind(&bind)),
                element_address: bind.element_address,
                app_key_index: bind.app_key_index,
                model: bind.model,
            }),
            MeshMessage::ModelSubscriptionAdd(add) if device => {
                MeshMessage::ModelSubscriptionStatus(ConfigModelSubscriptionStatus {
                    status: StatusEnvelope::new(self.subscribe(&add)),
                    element_address: add.element_address,
                    address: add.address,
                    model: add.model,
                })
            }
            MeshMessage::NodeReset if device => {
                self.reset_requested = true;
                MeshMessage::NodeResetStatus
            }
            MeshMessage::GenericOnOffGet if self.is_bound(ModelIdentifier::GENERIC_ONOFF_SERVER, key) => {
                self.onoff_status()
            }
            MeshMessage::GenericOnOffSet(set) if self.is_bound(ModelIdentifier::GENERIC_ONOFF_SERVER, key) => {
                self.onoff = set.on;
                self.onoff_status()
            }
            MeshMessage::GenericOnOffSetUnacknowledged(set)
                if self.is_bound(ModelIdentifier::GENERIC_ONOFF_SERVER, key) =>
            {
                self.onoff = set.on;
                return None;
            }
            MeshMessage::GenericLevelGet if self.is_bound(ModelIdentifier::GENERIC_LEVEL_SERVER, key) => {
                self.level_status()
            }
            MeshMessage::GenericLevelSet(set) if self.is_bound(ModelIdentifier::GENERIC_LEVEL_SERVER, key) => {
                self.level = set.level;
                self.level_status()
            }
            MeshMessage::GenericLevelSetUnacknowledged(set)
                if self.is_bound(ModelIdentifier::GENERIC_LEVEL_SERVER, key) =>
            {
                self.level = set.level;
                return None;
            }
            other => {
                debug!("{}: {} not handled", self.name, other.name());
                return None;
            }
        };
        Some(response)
    }

    fn onoff_status(&self) -> MeshMessage {
        MeshMessage::GenericOnOffStatus(GenericOnOffStatus {
            present: self.onoff,
            target: None,
        })
    }

    fn level_status(&self) -> MeshMessage {
        MeshMessage::GenericLevelStatus(GenericLevelStatus {
            present: self.level,
            target: None,
        })
    }

    fn is_bound(&self, model: ModelIdentifier, key: AccessKey) -> bool {
        match key {
            AccessKey::Application(index) => self
                .bindings
                .iter()
                .any(|b| b.model_id == model.id() && b.app_key_index == index),
            AccessKey::Device => false,
        }
    }

    /// Check that a local element at `address` hosts `model`
    fn check_element(&self, address: u16, model: ModelIdentifier) -> Result<(), ConfigStatus> {
        let ctx = self.context.as_ref().ok_or(ConfigStatus::UnspecifiedError)?;
        if !ctx.is_local_address(address) {
            return Err(ConfigStatus::InvalidAddress);
        }
        let index = (address - ctx.unicast_address) as usize;
        let element = self
            .composition
            .elements
            .get(index)
            .ok_or(ConfigStatus::InvalidAddress)?;
        if !element.models.contains(&model) {
            return Err(ConfigStatus::InvalidModel);
        }
        Ok(())
    }

    fn add_app_key(&mut self, add: &ConfigAppKeyAdd) -> ConfigStatus {
        let Some(ctx) = self.context.as_mut() else {
            return ConfigStatus::UnspecifiedError;
        };
        if ctx.network_key(add.net_key_index).is_err() {
            return ConfigStatus::InvalidNetKeyIndex;
        }
        if let Ok(existing) = ctx.app_key(add.app_key_index) {
            return if existing.key() == &add.app_key && existing.bound_net_key() == add.net_key_index {
                ConfigStatus::Success
            } else {
                ConfigStatus::KeyIndexAlreadyStored
            };
        }
        let added = ApplicationKey::new(add.app_key_index, add.net_key_index, &add.app_key)
            .and_then(|key| ctx.add_app_key(key));
        match added {
            Ok(()) => ConfigStatus::Success,
            Err(e) => {
                warn!("{}: app key {} rejected: {}", self.name, add.app_key_index, e);
                ConfigStatus::InsufficientResources
            }
        }
    }

    fn bind(&mut self, bind: &ConfigModelAppBind) -> ConfigStatus {
        if let Err(status) = self.check_element(bind.element_address, bind.model) {
            return status;
        }
        if bind.model == ModelIdentifier::CONFIG_SERVER {
            return ConfigStatus::CannotBind;
        }
        let known = self
            .context
            .as_ref()
            .is_some_and(|ctx| ctx.app_key(bind.app_key_index).is_ok());
        if !known {
            return ConfigStatus::InvalidAppKeyIndex;
        }
        let binding = ModelBinding {
            element: bind.element_address,
            model_id: bind.model.id(),
            app_key_index: bind.app_key_index,
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        ConfigStatus::Success
    }

    fn subscribe(&mut self, add: &ConfigModelSubscriptionAdd) -> ConfigStatus {
        if let Err(status) = self.check_element(add.element_address, add.model) {
            return status;
        }
        if !matches!(
            MeshAddress::from(add.address),
            MeshAddress::Group(_) | MeshAddress::Virtual(_)
        ) {
            return ConfigStatus::InvalidAddress;
        }
        let subscription = Subscription {
            element: add.element_address,
            model_id: add.model.id(),
            address: add.address,
        };
        if !self.subscriptions.contains(&subscription) {
            self.subscriptions.push(subscription);
        }
        ConfigStatus::Success
    }
}

/// Composition of [`LoopbackNode::light`]
pub fn light_composition() -> CompositionData {
    CompositionData {
        company_id: 0x05F1,
        product_id: 0x0001,
        version_id: 0x0001,
        crpl: 0x0010,
        features: Features::RELAY | Features::PROXY,
        elements: vec![Element {
            location: 0x0100,
            models: vec![
                ModelIdentifier::CONFIG_SERVER,
                ModelIdentifier::GENERIC_ONOFF_SERVER,
                ModelIdentifier::GENERIC_LEVEL_SERVER,
            ],
        }],
    }
}

