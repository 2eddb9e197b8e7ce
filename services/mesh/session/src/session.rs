//! The session actor.
//!
//! One task owns the [`NetworkContext`], the [`TransportEngine`], the pending
//! request table, the active [`Provisioner`] and the proxy framing. Handles
//! talk to it through a command queue; it reports through [`MeshEvent`]s and
//! writes bearer bytes to an unbounded channel. Timers are deadlines polled
//! by the task, so nothing here blocks the receive path.

use bytes::Bytes;
use mesh_access::{
    AccessError, MeshMessage, MessageCatalog, PendingRequests, StatusMessage,
};
use mesh_provisioning::{
    DeviceDescriptor, ProvisioningError, ProvisioningEvent, ProvisioningParameters,
    ProvisioningState, Provisioner,
};
use mesh_storage::MeshStore;
use mesh_transport::{
    AccessKey, KeyRefreshPhase, ModelBinding, NetworkContext, OutgoingAccess, ProvisionedNode,
    SendOutcome, Subscription, TransportEngine, TransportError, TransportOutput,
};
use mesh_wire::{ProxyPduType, ProxyReassembler, ProxySegmenter};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{now, sleep_until};
use crate::handle::Command;
use crate::{MeshError, MeshEvent, MeshHandle, SessionConfig};

type StatusReply = oneshot::Sender<Result<MeshMessage, MeshError>>;

/// Receiving ends handed to the session owner
#[derive(Debug)]
pub struct SessionChannels {
    /// Events in processing order
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
    /// Proxy PDU fragments for the bearer, each at most one MTU
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
}

struct ActiveProvisioning {
    provisioner: Provisioner,
    reply: Option<oneshot::Sender<Result<ProvisionedNode, MeshError>>>,
}

/// Actor state for one mesh session
pub struct MeshSession {
    config: SessionConfig,
    context: NetworkContext,
    engine: TransportEngine,
    pending: PendingRequests<StatusReply>,
    provisioning: Option<ActiveProvisioning>,
    catalog: MessageCatalog,
    reassembler: ProxyReassembler,
    segmenter: ProxySegmenter,
    store: MeshStore,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<MeshEvent>,
    outbound: mpsc::UnboundedSender<Bytes>,
    dirty: bool,
}

impl MeshSession {
    /// Start a session task with the built-in message catalogue
    pub fn spawn(
        config: SessionConfig,
        context: NetworkContext,
        store: MeshStore,
    ) -> Result<(MeshHandle, SessionChannels), MeshError> {
        Self::spawn_with_catalog(config, context, store, MessageCatalog::default())
    }

    /// Start a session task decoding with `catalog`
    pub fn spawn_with_catalog(
        config: SessionConfig,
        context: NetworkContext,
        store: MeshStore,
        catalog: MessageCatalog,
    ) -> Result<(MeshHandle, SessionChannels), MeshError> {
        let segmenter = ProxySegmenter::new(config.mtu)?;
        let (command_tx, command_rx) = mpsc::channel(config.command_queue_depth.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let session = MeshSession {
            engine: TransportEngine::new(config.transport.clone()),
            config,
            context,
            pending: PendingRequests::new(),
            provisioning: None,
            catalog,
            reassembler: ProxyReassembler::new(),
            segmenter,
            store,
            commands: command_rx,
            events: event_tx,
            outbound: outbound_tx,
            dirty: false,
        };
        tokio::spawn(session.run());

        Ok((
            MeshHandle::new(command_tx),
            SessionChannels {
                events: event_rx,
                outbound: outbound_rx,
            },
        ))
    }

    async fn run(mut self) {
        info!(
            "mesh session for network {} started at {:#06x}",
            self.context.name, self.context.unicast_address
        );
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.cancel_all();
                        self.flush().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.cancel_all();
                        break;
                    }
                },
                _ = sleep_until(deadline) => self.handle_timeout(now()),
            }
            self.flush().await;
        }
        self.flush().await;
        info!("mesh session for network {} stopped", self.context.name);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let provisioning = self
            .provisioning
            .as_ref()
            .and_then(|active| active.provisioner.poll_timeout());
        [
            self.engine.poll_timeout(),
            self.pending.next_deadline(),
            provisioning,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn handle_command(&mut self, command: Command) {
        let now = now();
        match command {
            Command::Provision { device, reply } => self.start_provisioning(now, device, reply),
            Command::SetAuthValue { value, reply } => {
                let result = match self.provisioning.as_mut() {
                    Some(active) => active
                        .provisioner
                        .set_auth_value(now, &value)
                        .map_err(MeshError::from),
                    None => Err(ProvisioningError::InvalidState(ProvisioningState::Idle).into()),
                };
                let _ = reply.send(result);
            }
            Command::AbortProvisioning { reply } => {
                let active = match self.provisioning.as_mut() {
                    Some(active) => {
                        active.provisioner.abort();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(active);
            }
            Command::Send {
                message,
                dst,
                key,
                reply,
            } => {
                let _ = reply.send(self.send(now, &message, dst, key).map(|_| ()));
            }
            Command::SendAcknowledged {
                message,
                dst,
                key,
                reply,
            } => self.send_acknowledged(now, message, dst, key, reply),
            Command::Deliver { bytes } => self.deliver(now, &bytes),
            Command::Disconnect { reply } => {
                self.cancel_all();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.context.clone());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
        self.process_outputs(now);
    }

    fn handle_timeout(&mut self, now: Instant) {
        self.engine.handle_timeout(&mut self.context, now);
        for expired in self.pending.expire(now) {
            warn!("no {} from {:#06x} before the deadline", expired.opcode, expired.dst);
            let _ = expired.payload.send(Err(AccessError::OperationTimedOut {
                dst: expired.dst,
                opcode: expired.opcode,
            }
            .into()));
        }
        if let Some(active) = self.provisioning.as_mut() {
            active.provisioner.handle_timeout(now);
        }
        self.process_outputs(now);
    }

    /// Resolve everything outstanding with `Cancelled`
    fn cancel_all(&mut self) {
        self.engine.cancel_all();
        for cancelled in self.pending.cancel_all() {
            debug!("request to {:#06x} for {} cancelled", cancelled.dst, cancelled.opcode);
            let _ = cancelled.payload.send(Err(AccessError::Cancelled.into()));
        }
        if let Some(active) = self.provisioning.as_mut() {
            active.provisioner.abort();
        }
        self.reassembler.reset();
        self.process_outputs(now());
        self.dirty = true;
        info!("network {}: session disconnected", self.context.name);
        self.emit(MeshEvent::Disconnected);
    }

    /// Drain the engine and the provisioner until both are quiet
    fn process_outputs(&mut self, now: Instant) {
        loop {
            if let Some(output) = self.engine.poll_output() {
                self.handle_transport_output(output);
                continue;
            }
            let event = self
                .provisioning
                .as_mut()
                .and_then(|active| active.provisioner.poll_event());
            match event {
                Some(event) => self.handle_provisioning_event(now, event),
                None => break,
            }
        }
        if self
            .provisioning
            .as_ref()
            .is_some_and(|active| active.provisioner.state().is_terminal())
        {
            self.provisioning = None;
        }
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    fn transmit(&self, pdu_type: ProxyPduType, pdu: &[u8]) {
        for fragment in self.segmenter.segment(pdu_type, pdu) {
            if self.outbound.send(fragment).is_err() {
                debug!("bearer receiver dropped, {:?} pdu discarded", pdu_type);
                return;
            }
        }
    }

    async fn flush(&mut self) {
        if !std::mem::take(&mut self.dirty) {
            return;
        }
        if let Err(e) = self
            .store
            .save_network(&self.context.name, &self.context)
            .await
        {
            error!("failed to persist network {}: {}", self.context.name, e);
            self.emit(MeshEvent::Failure(e.into()));
        }
    }

    // --- provisioning ---

    fn start_provisioning(
        &mut self,
        now: Instant,
        device: DeviceDescriptor,
        reply: oneshot::Sender<Result<ProvisionedNode, MeshError>>,
    ) {
        if self.provisioning.is_some() {
            let _ = reply.send(Err(MeshError::Busy));
            return;
        }
        let params = match self.provisioning_parameters() {
            Ok(params) => params,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let mut provisioner = Provisioner::new(self.config.provisioning.clone(), device, params);
        if let Err(e) = provisioner.start(now) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        self.provisioning = Some(ActiveProvisioning {
            provisioner,
            reply: Some(reply),
        });
    }

    fn provisioning_parameters(&self) -> Result<ProvisioningParameters, MeshError> {
        let key = self.context.primary_network_key()?;
        let mut flags = 0;
        if key.phase() == KeyRefreshPhase::Switching {
            flags |= 0x01;
        }
        if self.context.iv_index.update_active {
            flags |= 0x02;
        }
        Ok(ProvisioningParameters {
            network_key: *key.tx_key(),
            key_index: key.index(),
            flags,
            iv_index: self.context.iv_index.index,
            unicast_address: None,
        })
    }

    fn handle_provisioning_event(&mut self, now: Instant, event: ProvisioningEvent) {
        match event {
            ProvisioningEvent::Transmit(pdu) => self.transmit(ProxyPduType::Provisioning, &pdu),
            ProvisioningEvent::StateChanged(state) => {
                debug!("provisioning state {}", state);
                self.emit(MeshEvent::ProvisioningState(state));
            }
            ProvisioningEvent::CapabilitiesReceived(capabilities) => {
                debug!(
                    "device reports {} elements, algorithms {:?}",
                    capabilities.num_elements, capabilities.algorithms
                );
            }
            ProvisioningEvent::AddressRequired { element_count } => {
                self.assign_address(now, element_count)
            }
            ProvisioningEvent::AuthValueRequired {
                method,
                action,
                size,
            } => self.emit(MeshEvent::AuthValueRequired {
                method,
                action,
                size,
            }),
            ProvisioningEvent::DisplayAuthValue(value) => {
                self.emit(MeshEvent::DisplayAuthValue(value))
            }
            ProvisioningEvent::NodeProvisioned(node) => self.add_provisioned_node(node),
            ProvisioningEvent::DeviceProvisioned { .. } => {
                debug!("ignoring device-role provisioning result");
            }
            ProvisioningEvent::Failed(e) => {
                error!("provisioning failed: {}", e);
                if let Some(reply) = self.provisioning.as_mut().and_then(|a| a.reply.take()) {
                    let _ = reply.send(Err(e.clone().into()));
                }
                self.emit(MeshEvent::Failure(e.into()));
            }
        }
    }

    fn assign_address(&mut self, now: Instant, element_count: u8) {
        let allocated = self.context.allocate_unicast(element_count);
        let Some(active) = self.provisioning.as_mut() else {
            return;
        };
        match allocated {
            Ok(address) => {
                if let Err(e) = active.provisioner.assign_address(now, address) {
                    warn!("address {:#06x} not accepted: {}", address, e);
                }
            }
            Err(e) => {
                warn!("no room for {} elements: {}", element_count, e);
                if let Some(reply) = active.reply.take() {
                    let _ = reply.send(Err(e.clone().into()));
                }
                active.provisioner.abort();
                self.emit(MeshEvent::Failure(e.into()));
            }
        }
    }

    fn add_provisioned_node(&mut self, node: ProvisionedNode) {
        let reply = self.provisioning.as_mut().and_then(|a| a.reply.take());
        let result = match self.context.add_node(node.clone()) {
            Ok(()) => {
                info!(
                    "node {} added at {:#06x} ({} elements)",
                    node.uuid, node.unicast_address, node.element_count
                );
                self.dirty = true;
                self.emit(MeshEvent::NodeProvisioned(node.clone()));
                Ok(node)
            }
            Err(e) => {
                error!("provisioned node {} not added: {}", node.uuid, e);
                Err(MeshError::from(e))
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    // --- access ---

    fn send(
        &mut self,
        now: Instant,
        message: &MeshMessage,
        dst: u16,
        key: AccessKey,
    ) -> Result<SendOutcome, MeshError> {
        if message.uses_device_key() && key != AccessKey::Device {
            return Err(AccessError::InvalidParameters {
                opcode: message.opcode(),
                reason: "configuration messages are secured with the device key",
            }
            .into());
        }
        let payload = message.encode()?;
        let outcome = self.engine.send_access(
            &mut self.context,
            now,
            OutgoingAccess::new(dst, key, payload),
        )?;
        self.dirty = true;
        debug!(
            "tx {} to {:#06x} seq={} segmented={}",
            message.name(),
            dst,
            outcome.seq,
            outcome.segmented
        );
        Ok(outcome)
    }

    fn send_acknowledged(
        &mut self,
        now: Instant,
        message: MeshMessage,
        dst: u16,
        key: AccessKey,
        reply: StatusReply,
    ) {
        let Some(opcode) = message.response_opcode() else {
            let _ = reply.send(Err(AccessError::InvalidParameters {
                opcode: message.opcode(),
                reason: "message has no status",
            }
            .into()));
            return;
        };
        if let Err(e) = self.send(now, &message, dst, key) {
            let _ = reply.send(Err(e));
            return;
        }
        let deadline = now + self.config.request_timeout;
        if let Some(previous) = self.pending.insert(dst, opcode, deadline, reply) {
            let _ = previous.send(Err(AccessError::Cancelled.into()));
        }
    }

    fn deliver(&mut self, now: Instant, bytes: &[u8]) {
        match self.reassembler.push(bytes) {
            Ok(Some((pdu_type, pdu))) => self.handle_proxy_pdu(now, pdu_type, &pdu),
            Ok(None) => {}
            Err(e) => {
                warn!("bad proxy pdu: {}", e);
                self.reassembler.reset();
                self.emit(MeshEvent::Failure(e.into()));
            }
        }
    }

    fn handle_proxy_pdu(&mut self, now: Instant, pdu_type: ProxyPduType, pdu: &[u8]) {
        match pdu_type {
            ProxyPduType::NetworkPdu => {
                match self
                    .engine
                    .receive_network_pdu(&mut self.context, now, pdu)
                {
                    Ok(()) => self.dirty = true,
                    Err(e) => self.drop_pdu(e),
                }
            }
            ProxyPduType::MeshBeacon => {
                if let Err(e) = self.engine.receive_beacon(&mut self.context, pdu) {
                    self.drop_pdu(e);
                }
            }
            ProxyPduType::Provisioning => match self.provisioning.as_mut() {
                Some(active) => {
                    if let Err(e) = active.provisioner.receive(now, pdu) {
                        debug!("provisioning pdu ignored: {}", e);
                    }
                }
                None => debug!("provisioning pdu without an active attempt"),
            },
            ProxyPduType::ProxyConfiguration => debug!("proxy configuration pdu ignored"),
        }
    }

    fn drop_pdu(&self, e: TransportError) {
        warn!("network {}: pdu dropped: {}", self.context.name, e);
        self.emit(MeshEvent::Failure(e.into()));
    }

    fn handle_transport_output(&mut self, output: TransportOutput) {
        match output {
            TransportOutput::Transmit(pdu) => self.transmit(ProxyPduType::NetworkPdu, &pdu),
            TransportOutput::Access(incoming) => {
                let message = match self.catalog.decode_pdu(&incoming.payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("access message from {:#06x} dropped: {}", incoming.src, e);
                        self.emit(MeshEvent::Failure(e.into()));
                        return;
                    }
                };
                debug!("rx {} from {:#06x}", message.name(), incoming.src);
                if incoming.key == AccessKey::Device {
                    self.apply_config_status(incoming.src, &message);
                }
                if let Some(reply) = self.pending.resolve(incoming.src, message.opcode()) {
                    let _ = reply.send(Ok(message.clone()));
                }
                self.emit(MeshEvent::Message {
                    src: incoming.src,
                    dst: incoming.dst,
                    key: incoming.key,
                    message,
                });
            }
            TransportOutput::Control(control) => {
                debug!(
                    "control opcode {:#04x} from {:#06x} ignored",
                    control.opcode, control.src
                );
            }
            TransportOutput::Delivered { dst, seq_zero } => {
                debug!("delivered to {:#06x} seq_zero={}", dst, seq_zero);
            }
            TransportOutput::Failed {
                peer,
                seq_zero,
                error,
            } => {
                if matches!(error, TransportError::OperationTimedOut { .. }) {
                    for failed in self.pending.cancel_destination(peer) {
                        let _ = failed.payload.send(Err(error.clone().into()));
                    }
                }
                debug!("transaction with {:#06x} seq_zero={} ended", peer, seq_zero);
                self.emit(MeshEvent::Failure(error.into()));
            }
            TransportOutput::IvIndexUpdated(iv_index) => {
                info!(
                    "network {}: iv index {} (update {})",
                    self.context.name, iv_index.index, iv_index.update_active
                );
                self.dirty = true;
                self.emit(MeshEvent::IvIndexUpdated(iv_index));
            }
            TransportOutput::UnprovisionedDevice(beacon) => {
                self.emit(MeshEvent::UnprovisionedDevice {
                    uuid: Uuid::from_bytes(beacon.uuid),
                    oob_information: beacon.oob_information,
                })
            }
        }
    }

    /// Mirror a successful configuration status into the node record
    fn apply_config_status(&mut self, src: u16, message: &MeshMessage) {
        if *message == MeshMessage::NodeResetStatus {
            if let Some(node) = self.context.remove_node(src) {
                info!("node {:#06x} reset", node.unicast_address);
                self.dirty = true;
                self.emit(MeshEvent::NodeRemoved(node.unicast_address));
            }
            return;
        }
        let Some(node) = self.context.node_mut(src) else {
            return;
        };
        let changed = match message {
            MeshMessage::AppKeyStatus(status) if status.is_successful() => {
                node.app_keys.insert(status.app_key_index)
            }
            MeshMessage::ModelAppStatus(status) if status.is_successful() => {
                node.bind(ModelBinding {
                    element: status.element_address,
                    model_id: status.model.id(),
                    app_key_index: status.app_key_index,
                });
                true
            }
            MeshMessage::ModelSubscriptionStatus(status) if status.is_successful() => {
                node.subscribe(Subscription {
                    element: status.element_address,
                    model_id: status.model.id(),
                    address: status.address,
                });
                true
            }
            MeshMessage::CompositionDataStatus(status) if status.page == 0 => {
                node.composition = Some(status.data.to_vec());
                true
            }
            _ => false,
        };
        if changed {
            let node = node.clone();
            debug!("node {:#06x} updated", node.unicast_address);
            self.dirty = true;
            self.emit(MeshEvent::NodeUpdated(node));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{light_composition, ErrorKind, LoopbackNode};
    use mesh_access::{
        ConfigAppKeyAdd, ConfigModelAppBind, GenericOnOffSet, GenericOnOffStatus, ModelIdentifier,
        VendorMessage,
    };
    use mesh_transport::{ApplicationKey, NetworkKey};
    use mesh_wire::DEFAULT_PROXY_MTU;
    use std::time::Duration;

    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";
    const APP_KEY: &str = "63964771734fbd76e3b40519d1d94a48";
    const LAMP: u16 = 0x0100;
    /// Different key, same AID (0x26) as `APP_KEY`
    const SAME_AID_APP_KEY: &str = "00112233445566778899aabbccddee26";

    fn network() -> NetworkContext {
        let mut ctx = NetworkContext::new("home", 0x0001, NetworkKey::from_hex(0, NET_KEY).unwrap());
        ctx.add_app_key(ApplicationKey::from_hex(0, 0, APP_KEY).unwrap())
            .unwrap();
        ctx
    }

    fn network_with_lamp() -> NetworkContext {
        let mut ctx = network();
        ctx.add_node(ProvisionedNode::new("lamp", Uuid::nil(), LAMP, 1, 0, [0x9D; 16]))
            .unwrap();
        ctx
    }

    fn device(name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<MeshEvent>) -> Vec<MeshEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn failures(events: &[MeshEvent]) -> Vec<ErrorKind> {
        events
            .iter()
            .filter_map(|e| match e {
                MeshEvent::Failure(error) => Some(error.kind()),
                _ => None,
            })
            .collect()
    }

    fn messages(events: &[MeshEvent]) -> Vec<MeshMessage> {
        events
            .iter()
            .filter_map(|e| match e {
                MeshEvent::Message { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Proxy fragments of an access message sent by a node at `LAMP`
    fn from_lamp(ctx: &mut NetworkContext, message: &MeshMessage) -> Vec<Bytes> {
        let mut engine = TransportEngine::default();
        let payload = message.encode().unwrap();
        engine
            .send_access(
                ctx,
                Instant::now(),
                OutgoingAccess::new(0x0001, AccessKey::Application(0), payload),
            )
            .unwrap();
        let segmenter = ProxySegmenter::new(DEFAULT_PROXY_MTU).unwrap();
        engine
            .drain_outputs()
            .into_iter()
            .filter_map(|o| match o {
                TransportOutput::Transmit(pdu) => Some(pdu),
                _ => None,
            })
            .flat_map(|pdu| segmenter.segment(ProxyPduType::NetworkPdu, &pdu))
            .collect()
    }

    fn lamp_context(app_key: &str) -> NetworkContext {
        let mut ctx = NetworkContext::new("lamp", LAMP, NetworkKey::from_hex(0, NET_KEY).unwrap());
        ctx.add_app_key(ApplicationKey::from_hex(0, 0, app_key).unwrap())
            .unwrap();
        ctx
    }

    async fn deliver_all(handle: &MeshHandle, fragments: &[Bytes]) {
        for fragment in fragments {
            handle.deliver(fragment.clone()).await.unwrap();
        }
        // Commands run in order, so this waits for the deliveries
        handle.snapshot().await.unwrap();
    }

    /// Let spawned requests reach the session, then wait for them to be handled
    async fn settle(handle: &MeshHandle) {
        tokio::task::yield_now().await;
        handle.snapshot().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_and_configure_loopback_node() {
        let config = SessionConfig::default();
        let store = MeshStore::in_memory();
        let (handle, channels) = MeshSession::spawn(config.clone(), network(), store.clone()).unwrap();
        let SessionChannels { mut events, outbound } = channels;

        let lamp = LoopbackNode::light("lamp", &config).unwrap();
        let device = lamp.device();
        let bearer = lamp.spawn(handle.clone(), outbound);

        let node = handle.provision(device.clone()).await.unwrap();
        assert_eq!(node.uuid, device.uuid);
        assert_eq!(node.net_key_index, 0);
        let addr = node.unicast_address;
        assert_ne!(addr, 0x0001);

        let provisioning = drain(&mut events);
        assert!(provisioning
            .iter()
            .any(|e| matches!(e, MeshEvent::ProvisioningState(ProvisioningState::Complete))));
        assert!(provisioning
            .iter()
            .any(|e| matches!(e, MeshEvent::NodeProvisioned(n) if n.unicast_address == addr)));
        let saved: NetworkContext = store.load_network("home").await.unwrap().unwrap();
        assert!(saved.node_for_address(addr).is_some());

        let app_key = *network().app_key(0).unwrap().key();
        let status = handle
            .send_acknowledged(
                MeshMessage::AppKeyAdd(ConfigAppKeyAdd {
                    net_key_index: 0,
                    app_key_index: 0,
                    app_key,
                }),
                addr,
                AccessKey::Device,
            )
            .await
            .unwrap();
        assert!(matches!(status, MeshMessage::AppKeyStatus(s) if s.is_successful()));

        let status = handle
            .send_acknowledged(MeshMessage::CompositionDataGet { page: 0 }, addr, AccessKey::Device)
            .await
            .unwrap();
        let MeshMessage::CompositionDataStatus(composition) = status else {
            panic!("unexpected {:?}", status);
        };
        assert_eq!(composition.page_zero().unwrap(), light_composition());

        let bind = ConfigModelAppBind {
            element_address: addr,
            app_key_index: 0,
            model: ModelIdentifier::GENERIC_ONOFF_SERVER,
        };
        let status = handle
            .send_acknowledged(MeshMessage::ModelAppBind(bind), addr, AccessKey::Device)
            .await
            .unwrap();
        assert!(status.as_status().unwrap().is_successful());

        let status = handle
            .send_acknowledged(
                MeshMessage::GenericOnOffSet(GenericOnOffSet {
                    on: true,
                    tid: 1,
                    transition: None,
                }),
                addr,
                AccessKey::Application(0),
            )
            .await
            .unwrap();
        assert_eq!(
            status,
            MeshMessage::GenericOnOffStatus(GenericOnOffStatus {
                present: true,
                target: None
            })
        );

        let snapshot = handle.snapshot().await.unwrap();
        let record = snapshot.node_for_address(addr).unwrap();
        assert!(record.app_keys.contains(&0));
        assert!(record.composition.is_some());
        assert_eq!(
            record.bindings,
            vec![ModelBinding {
                element: addr,
                model_id: ModelIdentifier::GENERIC_ONOFF_SERVER.id(),
                app_key_index: 0,
            }]
        );
        let updates = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, MeshEvent::NodeUpdated(_)))
            .count();
        assert_eq!(updates, 3);

        let status = handle
            .send_acknowledged(MeshMessage::NodeReset, addr, AccessKey::Device)
            .await
            .unwrap();
        assert_eq!(status, MeshMessage::NodeResetStatus);
        assert_eq!(handle.snapshot().await.unwrap().nodes().count(), 0);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, MeshEvent::NodeRemoved(a) if *a == addr)));
        let saved: NetworkContext = store.load_network("home").await.unwrap().unwrap();
        assert!(saved.node_for_address(addr).is_none());

        handle.shutdown().await.unwrap();
        let lamp = bearer.await.unwrap();
        assert!(lamp.onoff());
        assert_eq!(lamp.unicast_address(), None);
        assert_eq!(lamp.provisioning_state(), ProvisioningState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_provisioning_is_busy() {
        let (handle, channels) =
            MeshSession::spawn(SessionConfig::default(), network(), MeshStore::in_memory()).unwrap();
        let SessionChannels {
            mut events,
            outbound: _outbound,
        } = channels;

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.provision(device("a")).await }
        });
        loop {
            match events.recv().await {
                Some(MeshEvent::ProvisioningState(ProvisioningState::Invite)) => break,
                Some(_) => continue,
                None => panic!("session stopped"),
            }
        }

        let second = handle.provision(device("b")).await;
        assert_eq!(second.unwrap_err().kind(), ErrorKind::Busy);

        assert!(handle.abort_provisioning().await.unwrap());
        let first = first.await.unwrap();
        assert_eq!(first.unwrap_err().kind(), ErrorKind::Cancelled);
        assert!(!handle.abort_provisioning().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_times_out_without_device() {
        let (handle, channels) =
            MeshSession::spawn(SessionConfig::default(), network(), MeshStore::in_memory()).unwrap();
        let SessionChannels {
            events: _events,
            outbound: mut bearer,
        } = channels;

        let result = handle.provision(device("ghost")).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::OperationTimedOut);
        // The Invite went out
        assert!(bearer.try_recv().is_ok());
        assert_eq!(handle.snapshot().await.unwrap().nodes().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_oob_provisioning() {
        let mut config = SessionConfig::default();
        config.provisioning.static_oob = Some([0x11; 16]);

        let (handle, channels) =
            MeshSession::spawn(config.clone(), network(), MeshStore::in_memory()).unwrap();
        let lamp = LoopbackNode::light("lamp", &config)
            .unwrap()
            .with_static_oob([0x11; 16]);
        let device = lamp.device();
        let _bearer = lamp.spawn(handle.clone(), channels.outbound);
        assert!(handle.provision(device).await.is_ok());

        let (handle, channels) =
            MeshSession::spawn(config.clone(), network(), MeshStore::in_memory()).unwrap();
        let lamp = LoopbackNode::light("lamp", &config)
            .unwrap()
            .with_static_oob([0x22; 16]);
        let device = lamp.device();
        let _bearer = lamp.spawn(handle.clone(), channels.outbound);
        let err = handle.provision(device).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfirmationFailed);
        assert_eq!(handle.snapshot().await.unwrap().nodes().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_request_times_out_once() {
        let config = SessionConfig::default();
        let (handle, channels) =
            MeshSession::spawn(config.clone(), network_with_lamp(), MeshStore::in_memory()).unwrap();
        let SessionChannels {
            mut events,
            outbound: mut bearer,
        } = channels;

        let started = tokio::time::Instant::now();
        let err = handle
            .send_acknowledged(MeshMessage::GenericOnOffGet, LAMP, AccessKey::Application(0))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MeshError::Access(AccessError::OperationTimedOut {
                dst: LAMP,
                opcode: mesh_access::opcodes::GENERIC_ONOFF_STATUS,
            })
        );
        assert!(started.elapsed() >= config.request_timeout);
        assert!(bearer.try_recv().is_ok());

        tokio::time::sleep(Duration::from_secs(60)).await;
        handle.snapshot().await.unwrap();
        assert!(failures(&drain(&mut events)).is_empty());

        // The engine keeps working
        handle
            .send(MeshMessage::GenericOnOffGet, LAMP, AccessKey::Application(0))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_requests() {
        let (handle, channels) =
            MeshSession::spawn(SessionConfig::default(), network_with_lamp(), MeshStore::in_memory()).unwrap();
        let SessionChannels {
            mut events,
            outbound: mut bearer,
        } = channels;

        let level = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .send_acknowledged(MeshMessage::GenericLevelGet, LAMP, AccessKey::Application(0))
                    .await
            }
        });
        settle(&handle).await;
        assert!(bearer.try_recv().is_ok());

        // Segmented, so it also leaves a transaction waiting for acks
        let app_key = ConfigAppKeyAdd {
            net_key_index: 0,
            app_key_index: 1,
            app_key: [0x5A; 16],
        };
        let add = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .send_acknowledged(MeshMessage::AppKeyAdd(app_key), LAMP, AccessKey::Device)
                    .await
            }
        });
        settle(&handle).await;
        let mut fragments = 0;
        while bearer.try_recv().is_ok() {
            fragments += 1;
        }
        assert!(fragments >= 2);

        handle.disconnect().await.unwrap();
        assert_eq!(level.await.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(add.await.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(e, MeshEvent::Disconnected)));
        assert!(failures(&events).contains(&ErrorKind::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_message_requires_device_key() {
        let (handle, _channels) =
            MeshSession::spawn(SessionConfig::default(), network_with_lamp(), MeshStore::in_memory()).unwrap();
        let err = handle
            .send(MeshMessage::CompositionDataGet { page: 0 }, LAMP, AccessKey::Application(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPdu);

        let err = handle
            .send_acknowledged(
                MeshMessage::GenericOnOffSetUnacknowledged(GenericOnOffSet {
                    on: false,
                    tid: 0,
                    transition: None,
                }),
                LAMP,
                AccessKey::Application(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Access(AccessError::InvalidParameters { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_pdu_is_reported_and_dropped() {
        let (handle, channels) =
            MeshSession::spawn(SessionConfig::default(), network(), MeshStore::in_memory()).unwrap();
        let mut events = channels.events;
        let mut lamp = lamp_context(APP_KEY);
        let status = MeshMessage::GenericOnOffStatus(GenericOnOffStatus {
            present: true,
            target: None,
        });

        let fragments = from_lamp(&mut lamp, &status);
        deliver_all(&handle, &fragments).await;
        deliver_all(&handle, &fragments).await;
        let events_seen = drain(&mut events);
        assert_eq!(messages(&events_seen), vec![status.clone()]);
        assert_eq!(failures(&events_seen), vec![ErrorKind::ReplayDetected]);

        // The next sequence number from the same source is accepted
        deliver_all(&handle, &from_lamp(&mut lamp, &status)).await;
        let events_seen = drain(&mut events);
        assert_eq!(messages(&events_seen), vec![status]);
        assert!(failures(&events_seen).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_application_key_fails_decryption() {
        let (handle, channels) =
            MeshSession::spawn(SessionConfig::default(), network(), MeshStore::in_memory()).unwrap();
        let mut events = channels.events;
        let mut stranger = lamp_context("00112233445566778899aabbccddeeff");

        let fragments = from_lamp(&mut stranger, &MeshMessage::GenericLevelGet);
        deliver_all(&handle, &fragments).await;
        let events_seen = drain(&mut events);
        assert!(messages(&events_seen).is_empty());
        assert_eq!(failures(&events_seen), vec![ErrorKind::DecryptionFailed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_aid_with_wrong_key_fails_decryption() {
        let (handle, channels) =
            MeshSession::spawn(SessionConfig::default(), network(), MeshStore::in_memory()).unwrap();
        let mut events = channels.events;
        let mut impostor = lamp_context(SAME_AID_APP_KEY);
        let genuine = network();
        assert_eq!(
            impostor.app_key(0).unwrap().aid(),
            genuine.app_key(0).unwrap().aid()
        );

        deliver_all(&handle, &from_lamp(&mut impostor, &MeshMessage::GenericLevelGet)).await;
        let events_seen = drain(&mut events);
        assert!(messages(&events_seen).is_empty());
        assert_eq!(failures(&events_seen), vec![ErrorKind::DecryptionFailed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vendor_messages_need_registration() {
        let vendor = MeshMessage::Vendor(VendorMessage::new(0x05F1, 0x01, vec![1, 2, 3]));

        let (handle, channels) =
            MeshSession::spawn(SessionConfig::default(), network(), MeshStore::in_memory()).unwrap();
        let mut events = channels.events;
        deliver_all(&handle, &from_lamp(&mut lamp_context(APP_KEY), &vendor)).await;
        assert_eq!(failures(&drain(&mut events)), vec![ErrorKind::UnknownOpcode]);

        let mut catalog = MessageCatalog::default();
        catalog.register_vendor(0x05F1, 0x01);
        let (handle, channels) = MeshSession::spawn_with_catalog(
            SessionConfig::default(),
            network(),
            MeshStore::in_memory(),
            catalog,
        )
        .unwrap();
        let mut events = channels.events;
        deliver_all(&handle, &from_lamp(&mut lamp_context(APP_KEY), &vendor)).await;
        assert_eq!(messages(&drain(&mut events)), vec![vendor]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handles_fail_after_shutdown() {
        let (handle, _channels) =
            MeshSession::spawn(SessionConfig::default(), network(), MeshStore::in_memory()).unwrap();
        handle.shutdown().await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap_err(), MeshError::SessionClosed);
    }
}
