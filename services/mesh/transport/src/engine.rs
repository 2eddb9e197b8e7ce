//! Sans-IO transport engine.
//!
//! The engine owns only in-flight segmentation state. Every entry point takes
//! the [`NetworkContext`] and the current time; results are queued as
//! [`TransportOutput`]s and drained by the caller, which also owns the
//! timers (see [`TransportEngine::poll_timeout`]).

use bytes::Bytes;
use mesh_crypto::{Key128, MicSize};
use mesh_wire::{
    decode_network_pdu, encode_network_pdu, is_unicast, open_access, seal_access, upper_nonce,
    BeaconFlags, LowerTransportPdu, MeshBeacon, NetworkHeader, NonceKind, RawNetworkPdu,
    SecureNetworkBeacon, SegmentAck, SegmentInfo, UnprovisionedDeviceBeacon, WireError,
    ACCESS_SEGMENT_SIZE, CONTROL_SEGMENT_SIZE, MAX_ACCESS_PAYLOAD, MAX_SEGMENTS, MAX_TTL,
    SEGMENT_ACK_OPCODE, SEQ_ZERO_MASK,
};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::context::valid_source;
use crate::iv::{IvIndex, IvUpdate};
use crate::keys::KeyRefreshPhase;
use crate::sar::{self, IncomingTransaction, OutgoingTransaction, SegmentKind};
use crate::{NetworkContext, TransportConfig, TransportError};

/// Largest access payload sent unsegmented with a 32-bit TransMIC
pub const MAX_UNSEGMENTED_ACCESS_PAYLOAD: usize = 11;

/// Key securing an upper transport access PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKey {
    /// Application key by index
    Application(u16),
    /// The peer's device key
    Device,
}

/// An access message to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAccess {
    /// Local element to send from; the primary element when `None`
    pub src: Option<u16>,
    /// Destination address
    pub dst: u16,
    /// Upper transport key
    pub key: AccessKey,
    /// Access PDU (opcode and parameters)
    pub payload: Bytes,
    /// TTL; the context default when `None`
    pub ttl: Option<u8>,
    /// Segment even when the payload would fit in one PDU
    pub force_segmented: bool,
    /// Use a 64-bit TransMIC (implies segmentation)
    pub big_mic: bool,
}

impl OutgoingAccess {
    /// A message with default options
    pub fn new(dst: u16, key: AccessKey, payload: impl Into<Bytes>) -> Self {
        Self {
            src: None,
            dst,
            key,
            payload: payload.into(),
            ttl: None,
            force_segmented: false,
            big_mic: false,
        }
    }
}

/// A transport control message to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingControl {
    /// Destination address
    pub dst: u16,
    /// 7-bit control opcode
    pub opcode: u8,
    /// Control parameters
    pub parameters: Bytes,
    /// TTL; the context default when `None`
    pub ttl: Option<u8>,
    /// Network key; the primary key when `None`
    pub net_key_index: Option<u16>,
}

/// What a send produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// Sequence number of the first PDU
    pub seq: u32,
    /// Low 13 bits of `seq`
    pub seq_zero: u16,
    /// Whether the message was segmented
    pub segmented: bool,
    /// Whether a Delivered or Failed output will follow
    pub acknowledged: bool,
}

/// A decrypted access message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingAccess {
    /// Source element
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// Received TTL
    pub ttl: u8,
    /// SeqAuth sequence number
    pub seq: u32,
    /// IV index used to decrypt
    pub iv_index: u32,
    /// Network key that authenticated the PDU
    pub net_key_index: u16,
    /// Key that decrypted the payload
    pub key: AccessKey,
    /// Access PDU
    pub payload: Bytes,
}

/// A received transport control message other than a segment ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingControl {
    /// Source element
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// Received TTL
    pub ttl: u8,
    /// Network key that authenticated the PDU
    pub net_key_index: u16,
    /// 7-bit control opcode
    pub opcode: u8,
    /// Control parameters
    pub parameters: Bytes,
}

/// Results queued by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutput {
    /// Network PDU to hand to the bearer
    Transmit(Bytes),
    /// Access message for the access layer
    Access(IncomingAccess),
    /// Transport control message
    Control(IncomingControl),
    /// A segmented send was fully acknowledged
    Delivered {
        /// Destination of the message
        dst: u16,
        /// SeqZero of the message
        seq_zero: u16,
    },
    /// A transaction ended without success
    Failed {
        /// Remote address of the transaction
        peer: u16,
        /// SeqZero of the transaction
        seq_zero: u16,
        /// Why it ended
        error: TransportError,
    },
    /// The IV index changed after an authenticated beacon
    IvIndexUpdated(IvIndex),
    /// An unprovisioned device advertised itself
    UnprovisionedDevice(UnprovisionedDeviceBeacon),
}

#[derive(Debug, Clone, Copy)]
struct RxMeta {
    src: u16,
    dst: u16,
    ttl: u8,
    seq: u32,
    iv_index: u32,
    net_key_index: u16,
}

type IncomingKey = (u16, u16, u16);
type OutgoingKey = (u16, u16);

/// Segmentation, reassembly, acknowledgment and replay handling
#[derive(Debug, Default)]
pub struct TransportEngine {
    config: TransportConfig,
    incoming: BTreeMap<IncomingKey, IncomingTransaction>,
    outgoing: BTreeMap<OutgoingKey, OutgoingTransaction>,
    outputs: VecDeque<TransportOutput>,
}

impl TransportEngine {
    /// Create an engine
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Next queued output
    pub fn poll_output(&mut self) -> Option<TransportOutput> {
        self.outputs.pop_front()
    }

    /// All queued outputs
    pub fn drain_outputs(&mut self) -> Vec<TransportOutput> {
        self.outputs.drain(..).collect()
    }

    /// Segmented sends awaiting acknowledgment
    pub fn pending_outgoing(&self) -> usize {
        self.outgoing.len()
    }

    /// Incoming messages being reassembled (or recently completed)
    pub fn pending_incoming(&self) -> usize {
        self.incoming.len()
    }

    // --- send ---

    /// Encrypt, segment and queue an access message
    pub fn send_access(
        &mut self,
        ctx: &mut NetworkContext,
        now: Instant,
        msg: OutgoingAccess,
    ) -> Result<SendOutcome, TransportError> {
        let src = msg.src.unwrap_or(ctx.unicast_address);
        if !ctx.is_local_address(src) {
            return Err(TransportError::UnknownNode(src));
        }
        if msg.dst == 0 {
            return Err(TransportError::Malformed(WireError::Malformed));
        }
        let ttl = msg.ttl.unwrap_or(ctx.default_ttl);
        if ttl > MAX_TTL {
            return Err(TransportError::Malformed(WireError::Ttl(ttl)));
        }
        if msg.payload.is_empty() {
            return Err(TransportError::Malformed(WireError::Truncated { need: 1, got: 0 }));
        }
        if msg.payload.len() > MAX_ACCESS_PAYLOAD {
            return Err(TransportError::PayloadTooLarge(msg.payload.len()));
        }

        let mic = MicSize::from_flag(msg.big_mic);
        let segmented = msg.force_segmented
            || msg.big_mic
            || msg.payload.len() > MAX_UNSEGMENTED_ACCESS_PAYLOAD;
        let count = if segmented {
            (msg.payload.len() + mic.size()).div_ceil(ACCESS_SEGMENT_SIZE)
        } else {
            1
        };
        if count > MAX_SEGMENTS {
            return Err(TransportError::PayloadTooLarge(msg.payload.len()));
        }

        let (nonce_kind, aid, key, net_key_index) = resolve_access_key(ctx, msg.key, msg.dst)?;
        ctx.network_key(net_key_index)?;
        ctx.ensure_sequences(count)?;

        let iv_index = ctx.iv_index.transmit_index();
        let seq = ctx.next_sequence()?;
        let szmic = segmented && msg.big_mic;
        let nonce = upper_nonce(nonce_kind, szmic, seq, src, msg.dst, iv_index);
        let upper = seal_access(&key, &nonce, &msg.payload, mic)?;
        let akf = nonce_kind == NonceKind::Application;

        debug!(
            "send access src={:#06x} dst={:#06x} seq={} len={} segments={}",
            src,
            msg.dst,
            seq,
            msg.payload.len(),
            count
        );

        if !segmented {
            let pdu = LowerTransportPdu::UnsegmentedAccess {
                akf,
                aid,
                upper_pdu: upper,
            };
            self.transmit(ctx, net_key_index, false, ttl, seq, src, msg.dst, &pdu)?;
            return Ok(SendOutcome {
                seq,
                seq_zero: seq_zero_of(seq),
                segmented: false,
                acknowledged: false,
            });
        }

        let kind = SegmentKind::Access { akf, aid, szmic };
        self.send_segmented(ctx, now, kind, src, msg.dst, ttl, net_key_index, seq, upper)
    }

    /// Queue a transport control message
    pub fn send_control(
        &mut self,
        ctx: &mut NetworkContext,
        now: Instant,
        msg: OutgoingControl,
    ) -> Result<SendOutcome, TransportError> {
        if msg.opcode > 0x7F {
            return Err(TransportError::Malformed(WireError::Opcode(msg.opcode)));
        }
        let ttl = msg.ttl.unwrap_or(ctx.default_ttl);
        if ttl > MAX_TTL {
            return Err(TransportError::Malformed(WireError::Ttl(ttl)));
        }
        let net_key_index = match msg.net_key_index {
            Some(index) => ctx.network_key(index)?.index(),
            None => ctx.primary_network_key()?.index(),
        };
        let src = ctx.unicast_address;

        let segmented = msg.parameters.len() > mesh_wire::lower::MAX_UNSEGMENTED_CONTROL_SIZE;
        let count = if segmented {
            msg.parameters.len().div_ceil(CONTROL_SEGMENT_SIZE)
        } else {
            1
        };
        if count > MAX_SEGMENTS {
            return Err(TransportError::PayloadTooLarge(msg.parameters.len()));
        }
        ctx.ensure_sequences(count)?;
        let seq = ctx.next_sequence()?;

        if !segmented {
            let pdu = LowerTransportPdu::UnsegmentedControl {
                opcode: msg.opcode,
                parameters: msg.parameters,
            };
            self.transmit(ctx, net_key_index, true, ttl, seq, src, msg.dst, &pdu)?;
            return Ok(SendOutcome {
                seq,
                seq_zero: seq_zero_of(seq),
                segmented: false,
                acknowledged: false,
            });
        }

        let kind = SegmentKind::Control { opcode: msg.opcode };
        self.send_segmented(ctx, now, kind, src, msg.dst, ttl, net_key_index, seq, msg.parameters)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_segmented(
        &mut self,
        ctx: &mut NetworkContext,
        now: Instant,
        kind: SegmentKind,
        src: u16,
        dst: u16,
        ttl: u8,
        net_key_index: u16,
        first_seq: u32,
        upper: Bytes,
    ) -> Result<SendOutcome, TransportError> {
        let seq_zero = seq_zero_of(first_seq);
        let size = kind.segment_size();
        let segments: Vec<Bytes> = (0..upper.len().div_ceil(size))
            .map(|i| upper.slice(i * size..((i + 1) * size).min(upper.len())))
            .collect();
        let seg_n = (segments.len() - 1) as u8;

        for (i, payload) in segments.iter().enumerate() {
            let seq = if i == 0 { first_seq } else { ctx.next_sequence()? };
            let info = SegmentInfo::new(seq_zero, i as u8, seg_n)?;
            self.transmit(ctx, net_key_index, kind.is_control(), ttl, seq, src, dst, &kind.pdu(info, payload.clone()))?;
        }

        let acknowledged = is_unicast(dst);
        if acknowledged {
            let tx = OutgoingTransaction {
                kind,
                src,
                ttl,
                net_key_index,
                seq_zero,
                segments,
                acked: 0,
                retries_left: self.config.segment_retries,
                ack_deadline: now + self.config.segment_ack_timeout(ttl),
            };
            if self.outgoing.insert((dst, seq_zero), tx).is_some() {
                self.fail(dst, seq_zero, TransportError::Cancelled);
            }
        }

        Ok(SendOutcome {
            seq: first_seq,
            seq_zero,
            segmented: true,
            acknowledged,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn transmit(
        &mut self,
        ctx: &NetworkContext,
        net_key_index: u16,
        ctl: bool,
        ttl: u8,
        seq: u32,
        src: u16,
        dst: u16,
        pdu: &LowerTransportPdu,
    ) -> Result<(), TransportError> {
        let key = ctx.network_key(net_key_index)?;
        let header = NetworkHeader {
            ctl,
            ttl,
            seq,
            src,
            dst,
        };
        let bytes = encode_network_pdu(
            &header,
            &pdu.encode()?,
            key.tx_material(),
            ctx.iv_index.transmit_index(),
        )?;
        trace!("tx network pdu {}", hex::encode(&bytes));
        self.outputs.push_back(TransportOutput::Transmit(bytes));
        Ok(())
    }

    // --- receive ---

    /// Process one network PDU from the bearer
    ///
    /// An error means the PDU was dropped; engine state is unaffected.
    pub fn receive_network_pdu(
        &mut self,
        ctx: &mut NetworkContext,
        now: Instant,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let raw = RawNetworkPdu::decode(bytes)?;
        let iv_index = ctx
            .iv_index
            .receive_index(raw.ivi)
            .ok_or(TransportError::DecryptionFailed)?;

        let (net_key_index, header, transport) = ctx
            .network_keys()
            .flat_map(|key| key.rx_materials().map(move |m| (key.index(), m)))
            .filter(|(_, m)| m.nid == raw.nid)
            .find_map(|(index, m)| {
                decode_network_pdu(&raw, m, iv_index)
                    .ok()
                    .map(|(header, transport)| (index, header, transport))
            })
            .ok_or(TransportError::DecryptionFailed)?;

        if ctx.is_local_address(header.src) {
            trace!("ignoring own pdu seq={}", header.seq);
            return Ok(());
        }
        if !valid_source(header.src) {
            return Err(TransportError::Malformed(WireError::Malformed));
        }
        if !ctx.accepts_destination(header.dst) {
            trace!("pdu for {:#06x} not for us", header.dst);
            return Ok(());
        }

        ctx.replay().check(header.src, iv_index, header.seq)?;
        let lower = LowerTransportPdu::decode(header.ctl, &transport)?;
        ctx.replay_mut().commit(header.src, iv_index, header.seq);

        debug!(
            "rx src={:#06x} dst={:#06x} seq={} ttl={} segmented={}",
            header.src,
            header.dst,
            header.seq,
            header.ttl,
            lower.is_segmented()
        );

        let meta = RxMeta {
            src: header.src,
            dst: header.dst,
            ttl: header.ttl,
            seq: header.seq,
            iv_index,
            net_key_index,
        };

        match lower {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
                self.deliver_access(ctx, meta, akf, aid, false, &upper_pdu)
            }
            LowerTransportPdu::UnsegmentedControl { opcode, parameters } => {
                if opcode == SEGMENT_ACK_OPCODE {
                    self.handle_segment_ack(ctx, now, header.src, &parameters)
                } else {
                    self.deliver_control(meta, opcode, parameters);
                    Ok(())
                }
            }
            segmented => self.receive_segment(ctx, now, meta, segmented),
        }
    }

    fn receive_segment(
        &mut self,
        ctx: &mut NetworkContext,
        now: Instant,
        meta: RxMeta,
        pdu: LowerTransportPdu,
    ) -> Result<(), TransportError> {
        let Some((kind, segment, payload)) = SegmentKind::from_pdu(pdu) else {
            return Ok(());
        };
        let seq_auth = sar::seq_auth(meta.seq, segment.seq_zero)
            .ok_or(TransportError::Malformed(WireError::Malformed))?;
        let key = (meta.src, meta.dst, segment.seq_zero);
        let ack_required = is_unicast(meta.dst);

        if let Some(existing) = self.incoming.get(&key) {
            if !existing.matches(kind, seq_auth, segment.seg_n) {
                if existing.seq_auth >= seq_auth {
                    debug!("stale segment for seq_zero {} dropped", segment.seq_zero);
                    return Ok(());
                }
                debug!("seq_zero {} reused by a newer message", segment.seq_zero);
                self.incoming.remove(&key);
            }
        }

        let incomplete_timeout = self.config.incomplete_timeout;
        let ack_delay = self.config.ack_delay;
        let tx = self.incoming.entry(key).or_insert_with(|| {
            IncomingTransaction::new(
                kind,
                seq_auth,
                meta.iv_index,
                meta.net_key_index,
                meta.ttl,
                segment.seg_n,
                now + incomplete_timeout,
            )
        });

        if tx.complete {
            // Retransmission after completion: the ack was lost
            let (received, ttl, net_key_index) = (tx.received, tx.ttl, tx.net_key_index);
            if ack_required {
                self.send_ack(ctx, meta.dst, meta.src, segment.seq_zero, received, ttl, net_key_index);
            }
            return Ok(());
        }

        tx.insert(segment, payload)?;
        tx.incomplete_deadline = now + incomplete_timeout;
        trace!(
            "segment {}/{} seq_zero={} from {:#06x}",
            segment.seg_o,
            segment.seg_n,
            segment.seq_zero,
            meta.src
        );

        if !tx.is_complete() {
            if ack_required && tx.ack_deadline.is_none() {
                tx.ack_deadline = Some(now + ack_delay);
            }
            return Ok(());
        }

        tx.complete = true;
        tx.ack_deadline = None;
        let message = tx.assemble();
        let (received, ttl, net_key_index, iv_index) =
            (tx.received, tx.ttl, tx.net_key_index, tx.iv_index);

        if ack_required {
            self.send_ack(ctx, meta.dst, meta.src, segment.seq_zero, received, ttl, net_key_index);
        }

        let meta = RxMeta {
            seq: seq_auth,
            iv_index,
            net_key_index,
            ttl,
            ..meta
        };
        match kind {
            SegmentKind::Access { akf, aid, szmic } => {
                self.deliver_access(ctx, meta, akf, aid, szmic, &message)
            }
            SegmentKind::Control { opcode } => {
                self.deliver_control(meta, opcode, message);
                Ok(())
            }
        }
    }

    fn deliver_access(
        &mut self,
        ctx: &NetworkContext,
        meta: RxMeta,
        akf: bool,
        aid: u8,
        szmic: bool,
        upper: &[u8],
    ) -> Result<(), TransportError> {
        let mic = MicSize::from_flag(szmic);
        let nonce_kind = NonceKind::from_akf(akf);
        let nonce = upper_nonce(nonce_kind, szmic, meta.seq, meta.src, meta.dst, meta.iv_index);

        let opened = if akf {
            ctx.app_keys()
                .filter(|k| k.aid() == aid && k.bound_net_key() == meta.net_key_index)
                .find_map(|k| {
                    open_access(k.key(), &nonce, upper, mic)
                        .ok()
                        .map(|p| (AccessKey::Application(k.index()), p))
                })
        } else {
            let node_key = ctx.node_for_address(meta.src).map(|n| &n.device_key);
            node_key
                .into_iter()
                .chain(ctx.device_key.as_ref())
                .find_map(|k| open_access(k, &nonce, upper, mic).ok())
                .map(|p| (AccessKey::Device, p))
        };

        let Some((key, payload)) = opened else {
            warn!(
                "cannot decrypt access message from {:#06x} seq={}",
                meta.src, meta.seq
            );
            return Err(TransportError::DecryptionFailed);
        };

        self.outputs.push_back(TransportOutput::Access(IncomingAccess {
            src: meta.src,
            dst: meta.dst,
            ttl: meta.ttl,
            seq: meta.seq,
            iv_index: meta.iv_index,
            net_key_index: meta.net_key_index,
            key,
            payload,
        }));
        Ok(())
    }

    fn deliver_control(&mut self, meta: RxMeta, opcode: u8, parameters: Bytes) {
        self.outputs.push_back(TransportOutput::Control(IncomingControl {
            src: meta.src,
            dst: meta.dst,
            ttl: meta.ttl,
            net_key_index: meta.net_key_index,
            opcode,
            parameters,
        }));
    }

    // --- acknowledgments ---

    #[allow(clippy::too_many_arguments)]
    fn send_ack(
        &mut self,
        ctx: &mut NetworkContext,
        src: u16,
        dst: u16,
        seq_zero: u16,
        block_ack: u32,
        received_ttl: u8,
        net_key_index: u16,
    ) {
        let ttl = if received_ttl == 0 { 0 } else { ctx.default_ttl };
        let pdu = SegmentAck::new(seq_zero, block_ack).to_pdu();
        let result = match ctx.next_sequence() {
            Ok(seq) => self.transmit(ctx, net_key_index, true, ttl, seq, src, dst, &pdu),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(
                "ack seq_zero={} block={:#010x} to {:#06x}",
                seq_zero, block_ack, dst
            ),
            Err(e) => warn!("cannot send segment ack to {:#06x}: {}", dst, e),
        }
    }

    fn handle_segment_ack(
        &mut self,
        ctx: &mut NetworkContext,
        now: Instant,
        src: u16,
        parameters: &[u8],
    ) -> Result<(), TransportError> {
        let ack = SegmentAck::decode_parameters(parameters)?;
        let key = (src, ack.seq_zero);
        let Some(mut tx) = self.outgoing.remove(&key) else {
            trace!("ack for unknown seq_zero {} from {:#06x}", ack.seq_zero, src);
            return Ok(());
        };

        if ack.block_ack == 0 {
            info!("peer {:#06x} cancelled seq_zero {}", src, ack.seq_zero);
            self.fail(src, ack.seq_zero, TransportError::Cancelled);
            return Ok(());
        }

        tx.acked |= ack.block_ack;
        if tx.is_acked() {
            debug!("seq_zero {} delivered to {:#06x}", ack.seq_zero, src);
            self.outputs.push_back(TransportOutput::Delivered {
                dst: src,
                seq_zero: ack.seq_zero,
            });
            return Ok(());
        }

        tx.ack_deadline = now + self.config.segment_ack_timeout(tx.ttl);
        if let Err(e) = self.retransmit(ctx, src, &tx) {
            self.fail(src, ack.seq_zero, e);
            return Ok(());
        }
        self.outgoing.insert(key, tx);
        Ok(())
    }

    fn retransmit(
        &mut self,
        ctx: &mut NetworkContext,
        dst: u16,
        tx: &OutgoingTransaction,
    ) -> Result<(), TransportError> {
        for index in tx.missing() {
            let seq = ctx.next_sequence()?;
            let info = SegmentInfo::new(tx.seq_zero, index, tx.seg_n())?;
            let pdu = tx.kind.pdu(info, tx.segments[index as usize].clone());
            self.transmit(ctx, tx.net_key_index, tx.kind.is_control(), tx.ttl, seq, tx.src, dst, &pdu)?;
        }
        debug!(
            "retransmitted seq_zero={} to {:#06x}, {} retries left",
            tx.seq_zero, dst, tx.retries_left
        );
        Ok(())
    }

    fn fail(&mut self, peer: u16, seq_zero: u16, error: TransportError) {
        self.outputs.push_back(TransportOutput::Failed {
            peer,
            seq_zero,
            error,
        });
    }

    // --- timers ---

    /// Earliest deadline the caller must wake up for
    pub fn poll_timeout(&self) -> Option<Instant> {
        let incoming = self
            .incoming
            .values()
            .flat_map(|t| [Some(t.incomplete_deadline), t.ack_deadline])
            .flatten();
        let outgoing = self.outgoing.values().map(|t| t.ack_deadline);
        incoming.chain(outgoing).min()
    }

    /// Run every timer due at `now`
    pub fn handle_timeout(&mut self, ctx: &mut NetworkContext, now: Instant) {
        let expired: Vec<IncomingKey> = self
            .incoming
            .iter()
            .filter(|(_, t)| t.incomplete_deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            let Some(tx) = self.incoming.remove(&key) else {
                continue;
            };
            if !tx.complete {
                let (src, _, seq_zero) = key;
                warn!(
                    "incomplete message from {:#06x} seq_zero={} discarded",
                    src, seq_zero
                );
                self.fail(
                    src,
                    seq_zero,
                    TransportError::SegmentsNotReceivedTimeout { src, seq_zero },
                );
            }
        }

        let acks: Vec<(IncomingKey, u32, u8, u16)> = self
            .incoming
            .iter_mut()
            .filter(|(_, t)| t.ack_deadline.is_some_and(|d| d <= now))
            .map(|(k, t)| {
                t.ack_deadline = None;
                (*k, t.received, t.ttl, t.net_key_index)
            })
            .collect();
        for ((src, dst, seq_zero), received, ttl, net_key_index) in acks {
            self.send_ack(ctx, dst, src, seq_zero, received, ttl, net_key_index);
        }

        let due: Vec<OutgoingKey> = self
            .outgoing
            .iter()
            .filter(|(_, t)| t.ack_deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            let Some(mut tx) = self.outgoing.remove(&key) else {
                continue;
            };
            let (dst, seq_zero) = key;
            if tx.retries_left == 0 {
                warn!("no ack from {:#06x} for seq_zero={}", dst, seq_zero);
                self.fail(dst, seq_zero, TransportError::OperationTimedOut { dst, seq_zero });
                continue;
            }
            tx.retries_left -= 1;
            tx.ack_deadline = now + self.config.segment_ack_timeout(tx.ttl);
            match self.retransmit(ctx, dst, &tx) {
                Ok(()) => {
                    self.outgoing.insert(key, tx);
                }
                Err(e) => self.fail(dst, seq_zero, e),
            }
        }
    }

    /// Drop every transaction, reporting each as cancelled
    pub fn cancel_all(&mut self) {
        let outgoing = std::mem::take(&mut self.outgoing);
        for (dst, seq_zero) in outgoing.into_keys() {
            self.fail(dst, seq_zero, TransportError::Cancelled);
        }
        let incoming = std::mem::take(&mut self.incoming);
        for ((src, _, seq_zero), tx) in incoming {
            if !tx.complete {
                self.fail(src, seq_zero, TransportError::Cancelled);
            }
        }
    }

    // --- beacons ---

    /// Process a mesh beacon from the bearer
    pub fn receive_beacon(&mut self, ctx: &mut NetworkContext, bytes: &[u8]) -> Result<(), TransportError> {
        match MeshBeacon::decode(bytes)? {
            MeshBeacon::Unprovisioned(beacon) => {
                debug!(
                    "unprovisioned device {}",
                    uuid::Uuid::from_bytes(beacon.uuid)
                );
                self.outputs
                    .push_back(TransportOutput::UnprovisionedDevice(beacon));
                Ok(())
            }
            MeshBeacon::SecureNetwork(beacon) => self.receive_secure_beacon(ctx, &beacon),
        }
    }

    fn receive_secure_beacon(
        &mut self,
        ctx: &mut NetworkContext,
        beacon: &SecureNetworkBeacon,
    ) -> Result<(), TransportError> {
        let (index, new_key) = ctx
            .network_keys()
            .find_map(|key| {
                key.rx_materials()
                    .find(|m| m.network_id == beacon.network_id && beacon.verify(&m.beacon_key))
                    .map(|m| (key.index(), key.is_new_material(m)))
            })
            .ok_or(TransportError::DecryptionFailed)?;

        let key = ctx.network_key_mut(index)?;
        let refresh = beacon.flags.contains(BeaconFlags::KEY_REFRESH);
        match (key.phase(), refresh, new_key) {
            (KeyRefreshPhase::Distributing, true, true) => key.switch(),
            (KeyRefreshPhase::Distributing | KeyRefreshPhase::Switching, false, true) => key.revoke(),
            _ => {}
        }

        let update = beacon.flags.contains(BeaconFlags::IV_UPDATE);
        if ctx.apply_iv_beacon(beacon.iv_index, update)? != IvUpdate::Unchanged {
            self.outputs
                .push_back(TransportOutput::IvIndexUpdated(ctx.iv_index));
        }
        Ok(())
    }

    /// Secure network beacon for one of the context's network keys
    pub fn build_beacon(&self, ctx: &NetworkContext, net_key_index: u16) -> Result<Bytes, TransportError> {
        let key = ctx.network_key(net_key_index)?;
        let mut flags = key.beacon_flags();
        if ctx.iv_index.update_active {
            flags |= BeaconFlags::IV_UPDATE;
        }
        let material = key.tx_material();
        Ok(SecureNetworkBeacon::authenticated(
            &material.beacon_key,
            flags,
            material.network_id,
            ctx.iv_index.index,
        )
        .encode())
    }
}

fn seq_zero_of(seq: u32) -> u16 {
    (seq & SEQ_ZERO_MASK as u32) as u16
}

fn resolve_access_key(
    ctx: &NetworkContext,
    key: AccessKey,
    dst: u16,
) -> Result<(NonceKind, u8, Key128, u16), TransportError> {
    match key {
        AccessKey::Application(index) => {
            let app = ctx.app_key(index)?;
            Ok((NonceKind::Application, app.aid(), *app.key(), app.bound_net_key()))
        }
        AccessKey::Device => {
            let device_key = *ctx
                .device_key_for(dst)
                .ok_or(TransportError::UnknownNode(dst))?;
            let net_key_index = match ctx.node_for_address(dst) {
                Some(node) => node.net_key_index,
                None => ctx.primary_network_key()?.index(),
            };
            Ok((NonceKind::Device, 0, device_key, net_key_index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApplicationKey, NetworkKey, ProvisionedNode};
    use std::time::Duration;
    use uuid::Uuid;

    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";
    const APP_KEY: &str = "63964771734fbd76e3b40519d1d94a48";
    const DEVICE_KEY: [u8; 16] = [0x9D; 16];
    const NODE: u16 = 0x0100;

    fn pair() -> (NetworkContext, NetworkContext) {
        let net = NetworkKey::from_hex(0, NET_KEY).unwrap();
        let app = ApplicationKey::from_hex(0, 0, APP_KEY).unwrap();

        let mut a = NetworkContext::new("a", 0x0001, net.clone());
        a.add_app_key(app.clone()).unwrap();
        a.add_node(ProvisionedNode::new("b", Uuid::nil(), NODE, 1, 0, DEVICE_KEY))
            .unwrap();

        let mut b = NetworkContext::new("b", NODE, net);
        b.add_app_key(app).unwrap();
        b.device_key = Some(DEVICE_KEY);
        (a, b)
    }

    fn transmits(outputs: &[TransportOutput]) -> Vec<Bytes> {
        outputs
            .iter()
            .filter_map(|o| match o {
                TransportOutput::Transmit(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    fn feed(engine: &mut TransportEngine, ctx: &mut NetworkContext, now: Instant, pdus: &[Bytes]) -> Vec<TransportOutput> {
        for pdu in pdus {
            engine.receive_network_pdu(ctx, now, pdu).unwrap();
        }
        engine.drain_outputs()
    }

    fn access(outputs: &[TransportOutput]) -> Vec<IncomingAccess> {
        outputs
            .iter()
            .filter_map(|o| match o {
                TransportOutput::Access(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unsegmented_access_known_answer() {
        let net = NetworkKey::from_hex(0, NET_KEY).unwrap();
        let mut ctx = NetworkContext::new("vec", 0x0003, net.clone());
        ctx.add_app_key(ApplicationKey::from_hex(0, 0, APP_KEY).unwrap())
            .unwrap();
        ctx.iv_index = IvIndex::new(0x1234_5678);
        ctx.next_seq = 0x3129AB;

        let mut engine = TransportEngine::default();
        let msg = OutgoingAccess {
            ttl: Some(3),
            ..OutgoingAccess::new(0x1201, AccessKey::Application(0), hex::decode("04000000010703").unwrap())
        };
        let outcome = engine.send_access(&mut ctx, Instant::now(), msg).unwrap();
        assert!(!outcome.segmented);
        assert_eq!(outcome.seq, 0x3129AB);
        assert_eq!(ctx.next_seq, 0x3129AC);

        let pdus = transmits(&engine.drain_outputs());
        assert_eq!(pdus.len(), 1);
        let raw = RawNetworkPdu::decode(&pdus[0]).unwrap();
        let (header, transport) = decode_network_pdu(&raw, net.tx_material(), 0x1234_5678).unwrap();
        assert_eq!((header.src, header.dst, header.ttl), (0x0003, 0x1201, 3));
        match LowerTransportPdu::decode(false, &transport).unwrap() {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
                assert!(akf);
                assert_eq!(aid, 0x26);
                assert_eq!(hex::encode(upper_pdu), "d608adc6dc582882f45ec6");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unsegmented_exchange() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();

        ea.send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), vec![0x82, 0x01]))
            .unwrap();
        let out = feed(&mut eb, &mut b, now, &transmits(&ea.drain_outputs()));
        let msgs = access(&out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].src, 0x0001);
        assert_eq!(msgs[0].key, AccessKey::Application(0));
        assert_eq!(msgs[0].payload.as_ref(), &[0x82, 0x01]);
        assert_eq!(b.replay().last(0x0001), Some((0, 0)));
    }

    #[test]
    fn test_device_key_both_directions() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();

        ea.send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Device, vec![0x80, 0x08, 0x00]))
            .unwrap();
        let msgs = access(&feed(&mut eb, &mut b, now, &transmits(&ea.drain_outputs())));
        assert_eq!(msgs[0].key, AccessKey::Device);

        eb.send_access(&mut b, now, OutgoingAccess::new(0x0001, AccessKey::Device, vec![0x80, 0x03, 0x00]))
            .unwrap();
        let msgs = access(&feed(&mut ea, &mut a, now, &transmits(&eb.drain_outputs())));
        assert_eq!(msgs[0].payload.as_ref(), &[0x80, 0x03, 0x00]);

        // No device key for an unknown peer
        let err = ea
            .send_access(&mut a, now, OutgoingAccess::new(0x0200, AccessKey::Device, vec![1]))
            .unwrap_err();
        assert_eq!(err, TransportError::UnknownNode(0x0200));
    }

    #[test]
    fn test_segmented_exchange_is_acknowledged() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();
        let payload: Vec<u8> = (0..20).collect();

        let outcome = ea
            .send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), payload.clone()))
            .unwrap();
        assert!(outcome.segmented && outcome.acknowledged);
        let pdus = transmits(&ea.drain_outputs());
        assert_eq!(pdus.len(), 2);
        assert_eq!(a.next_seq, 2);

        let out = feed(&mut eb, &mut b, now, &pdus);
        assert_eq!(access(&out)[0].payload.as_ref(), payload.as_slice());
        assert_eq!(access(&out)[0].seq, outcome.seq);
        let acks = transmits(&out);
        assert_eq!(acks.len(), 1);

        let out = feed(&mut ea, &mut a, now, &acks);
        assert_eq!(
            out,
            vec![TransportOutput::Delivered {
                dst: NODE,
                seq_zero: outcome.seq_zero
            }]
        );
        assert_eq!(ea.pending_outgoing(), 0);
    }

    #[test]
    fn test_big_mic_and_payload_limits() {
        let (mut a, _) = pair();
        let mut ea = TransportEngine::default();
        let now = Instant::now();

        let err = ea
            .send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), vec![0u8; 381]))
            .unwrap_err();
        assert_eq!(err, TransportError::PayloadTooLarge(381));

        // 380 + 8 byte TransMIC needs 33 segments
        let msg = OutgoingAccess {
            big_mic: true,
            ..OutgoingAccess::new(NODE, AccessKey::Application(0), vec![0u8; 380])
        };
        assert_eq!(
            ea.send_access(&mut a, now, msg).unwrap_err(),
            TransportError::PayloadTooLarge(380)
        );
        assert_eq!(a.next_seq, 0);

        let outcome = ea
            .send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), vec![0u8; 380]))
            .unwrap();
        assert!(outcome.segmented);
        assert_eq!(transmits(&ea.drain_outputs()).len(), 32);

        let msg = OutgoingAccess {
            force_segmented: true,
            ..OutgoingAccess::new(NODE, AccessKey::Application(0), vec![1, 2])
        };
        assert!(ea.send_access(&mut a, now, msg).unwrap().segmented);
    }

    #[test]
    fn test_every_segment_count_reassembles() {
        let now = Instant::now();
        for len in [1usize, 11, 12, 20, 100, 200, 379, 380] {
            let (mut a, mut b) = pair();
            let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();

            let outcome = ea
                .send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), payload.clone()))
                .unwrap();
            let pdus = transmits(&ea.drain_outputs());
            let expected = if outcome.segmented { (len + 4).div_ceil(12) } else { 1 };
            assert_eq!(pdus.len(), expected, "len {}", len);

            let out = feed(&mut eb, &mut b, now, &pdus);
            let msgs = access(&out);
            assert_eq!(msgs.len(), 1, "len {}", len);
            assert_eq!(msgs[0].payload.as_ref(), payload.as_slice(), "len {}", len);

            if outcome.segmented {
                let out = feed(&mut ea, &mut a, now, &transmits(&out));
                assert!(out.contains(&TransportOutput::Delivered {
                    dst: NODE,
                    seq_zero: outcome.seq_zero
                }));
                assert_eq!(ea.pending_outgoing(), 0);
            }
        }
    }

    #[test]
    fn test_missing_segment_is_retransmitted() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();
        let payload: Vec<u8> = (0..30).collect();

        ea.send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), payload.clone()))
            .unwrap();
        let pdus = transmits(&ea.drain_outputs());
        assert_eq!(pdus.len(), 3);

        // Segment 1 is lost
        let out = feed(&mut eb, &mut b, now, &[pdus[0].clone(), pdus[2].clone()]);
        assert!(out.is_empty());
        let ack_at = eb.poll_timeout().unwrap();
        assert_eq!(ack_at, now + Duration::from_millis(150));
        eb.handle_timeout(&mut b, ack_at);
        let partial_ack = transmits(&eb.drain_outputs());
        assert_eq!(partial_ack.len(), 1);

        let retransmitted = transmits(&feed(&mut ea, &mut a, ack_at, &partial_ack));
        assert_eq!(retransmitted.len(), 1);

        let out = feed(&mut eb, &mut b, ack_at, &retransmitted);
        assert_eq!(access(&out)[0].payload.as_ref(), payload.as_slice());
        let out = feed(&mut ea, &mut a, ack_at, &transmits(&out));
        assert!(matches!(out[0], TransportOutput::Delivered { dst: NODE, .. }));
    }

    #[test]
    fn test_retries_exhausted() {
        let (mut a, _) = pair();
        let mut ea = TransportEngine::default();
        let now = Instant::now();

        let outcome = ea
            .send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), vec![0u8; 20]))
            .unwrap();
        ea.drain_outputs();

        for _ in 0..2 {
            let deadline = ea.poll_timeout().unwrap();
            ea.handle_timeout(&mut a, deadline);
            assert_eq!(transmits(&ea.drain_outputs()).len(), 2);
        }
        let deadline = ea.poll_timeout().unwrap();
        ea.handle_timeout(&mut a, deadline);
        assert_eq!(
            ea.drain_outputs(),
            vec![TransportOutput::Failed {
                peer: NODE,
                seq_zero: outcome.seq_zero,
                error: TransportError::OperationTimedOut {
                    dst: NODE,
                    seq_zero: outcome.seq_zero
                },
            }]
        );
        assert!(ea.poll_timeout().is_none());
    }

    #[test]
    fn test_incomplete_timeout() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();

        let outcome = ea
            .send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), vec![0u8; 20]))
            .unwrap();
        let pdus = transmits(&ea.drain_outputs());
        feed(&mut eb, &mut b, now, &pdus[..1]);

        let later = now + Duration::from_secs(10);
        eb.handle_timeout(&mut b, later);
        let out = eb.drain_outputs();
        assert!(out.contains(&TransportOutput::Failed {
            peer: 0x0001,
            seq_zero: outcome.seq_zero,
            error: TransportError::SegmentsNotReceivedTimeout {
                src: 0x0001,
                seq_zero: outcome.seq_zero
            },
        }));
        assert_eq!(eb.pending_incoming(), 0);
    }

    #[test]
    fn test_replay_and_wrong_key_are_dropped() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();

        ea.send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), vec![1, 2, 3]))
            .unwrap();
        let pdu = transmits(&ea.drain_outputs()).remove(0);
        eb.receive_network_pdu(&mut b, now, &pdu).unwrap();
        assert_eq!(
            eb.receive_network_pdu(&mut b, now, &pdu),
            Err(TransportError::ReplayDetected { src: 0x0001, seq: 0 })
        );

        let mut stranger = NetworkContext::new(
            "c",
            NODE,
            NetworkKey::new(0, &[0x11; 16]).unwrap(),
        );
        let mut ec = TransportEngine::default();
        assert_eq!(
            ec.receive_network_pdu(&mut stranger, now, &pdu),
            Err(TransportError::DecryptionFailed)
        );
        assert!(stranger.replay().is_empty());

        // Same AID, different key: the MIC check rejects it
        let mut impostor = NetworkContext::new("e", NODE, NetworkKey::from_hex(0, NET_KEY).unwrap());
        impostor
            .add_app_key(ApplicationKey::from_hex(0, 0, "00112233445566778899aabbccddee26").unwrap())
            .unwrap();
        assert_eq!(impostor.app_key(0).unwrap().aid(), a.app_key(0).unwrap().aid());
        assert_eq!(
            TransportEngine::default().receive_network_pdu(&mut impostor, now, &pdu),
            Err(TransportError::DecryptionFailed)
        );

        // Network key matches but no app key does
        let mut no_app = NetworkContext::new("d", NODE, NetworkKey::from_hex(0, NET_KEY).unwrap());
        assert_eq!(
            ec.receive_network_pdu(&mut no_app, now, &pdu),
            Err(TransportError::DecryptionFailed)
        );
        assert!(matches!(
            ec.receive_network_pdu(&mut no_app, now, &[0u8; 5]),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn test_own_and_foreign_destinations_ignored() {
        let (mut a, mut b) = pair();
        let mut ea = TransportEngine::default();
        let now = Instant::now();

        ea.send_access(&mut a, now, OutgoingAccess::new(0x0200, AccessKey::Application(0), vec![1]))
            .unwrap();
        let pdu = transmits(&ea.drain_outputs()).remove(0);
        // Echo of our own PDU
        ea.receive_network_pdu(&mut a, now, &pdu).unwrap();
        assert!(ea.drain_outputs().is_empty());
        // Unicast for another node
        let mut eb = TransportEngine::default();
        eb.receive_network_pdu(&mut b, now, &pdu).unwrap();
        assert!(eb.drain_outputs().is_empty());
    }

    #[test]
    fn test_block_ack_zero_cancels() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();

        let outcome = ea
            .send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), vec![0u8; 20]))
            .unwrap();
        ea.drain_outputs();

        eb.send_control(
            &mut b,
            now,
            OutgoingControl {
                dst: 0x0001,
                opcode: SEGMENT_ACK_OPCODE,
                parameters: SegmentAck::new(outcome.seq_zero, 0).encode_parameters(),
                ttl: None,
                net_key_index: None,
            },
        )
        .unwrap();
        let out = feed(&mut ea, &mut a, now, &transmits(&eb.drain_outputs()));
        assert_eq!(
            out,
            vec![TransportOutput::Failed {
                peer: NODE,
                seq_zero: outcome.seq_zero,
                error: TransportError::Cancelled
            }]
        );
    }

    #[test]
    fn test_group_send_is_not_tracked() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();

        let outcome = ea
            .send_access(&mut a, now, OutgoingAccess::new(0xC000, AccessKey::Application(0), vec![0u8; 20]))
            .unwrap();
        assert!(outcome.segmented && !outcome.acknowledged);
        assert!(ea.poll_timeout().is_none());

        let out = feed(&mut eb, &mut b, now, &transmits(&ea.drain_outputs()));
        // Delivered without a segment ack
        assert_eq!(access(&out).len(), 1);
        assert!(transmits(&out).is_empty());
    }

    #[test]
    fn test_segmented_control_message() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();
        let parameters = Bytes::from((0..20).collect::<Vec<u8>>());

        ea.send_control(
            &mut a,
            now,
            OutgoingControl {
                dst: NODE,
                opcode: 0x0A,
                parameters: parameters.clone(),
                ttl: None,
                net_key_index: None,
            },
        )
        .unwrap();
        let pdus = transmits(&ea.drain_outputs());
        assert_eq!(pdus.len(), 3);

        let out = feed(&mut eb, &mut b, now, &pdus);
        let control = out
            .iter()
            .find_map(|o| match o {
                TransportOutput::Control(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(control.opcode, 0x0A);
        assert_eq!(control.parameters, parameters);
    }

    #[test]
    fn test_cancel_all() {
        let (mut a, _) = pair();
        let mut ea = TransportEngine::default();
        let now = Instant::now();

        let outcome = ea
            .send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), vec![0u8; 20]))
            .unwrap();
        ea.drain_outputs();
        ea.cancel_all();
        assert_eq!(
            ea.drain_outputs(),
            vec![TransportOutput::Failed {
                peer: NODE,
                seq_zero: outcome.seq_zero,
                error: TransportError::Cancelled
            }]
        );
        assert!(ea.poll_timeout().is_none());
    }

    #[test]
    fn test_beacon_drives_iv_update() {
        let (mut a, mut b) = pair();
        let (ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        a.iv_index = IvIndex::new(0x1234_5678);
        b.iv_index = IvIndex::new(0x1234_5678);

        let beacon = ea.build_beacon(&a, 0).unwrap();
        assert_eq!(
            hex::encode(&beacon),
            "01003ecaff672f673370123456788ea261582f364f6f"
        );
        eb.receive_beacon(&mut b, &beacon).unwrap();
        assert!(eb.drain_outputs().is_empty());

        a.begin_iv_update();
        let beacon = ea.build_beacon(&a, 0).unwrap();
        assert_eq!(
            hex::encode(&beacon),
            "01023ecaff672f67337012345679c2af80ad072a135c"
        );
        b.next_seq = 7;
        eb.receive_beacon(&mut b, &beacon).unwrap();
        assert_eq!(
            eb.drain_outputs(),
            vec![TransportOutput::IvIndexUpdated(IvIndex {
                index: 0x1234_5679,
                update_active: true
            })]
        );
        assert_eq!(b.next_seq, 7);

        let mut tampered = beacon.to_vec();
        tampered[21] ^= 1;
        assert_eq!(
            eb.receive_beacon(&mut b, &tampered),
            Err(TransportError::DecryptionFailed)
        );
    }

    #[test]
    fn test_messages_survive_iv_update() {
        let (mut a, mut b) = pair();
        let (mut ea, mut eb) = (TransportEngine::default(), TransportEngine::default());
        let now = Instant::now();
        a.iv_index = IvIndex::new(8);
        b.iv_index = IvIndex::new(8);
        b.begin_iv_update();

        // a still transmits with 8, b already moved to 9 and accepts both
        ea.send_access(&mut a, now, OutgoingAccess::new(NODE, AccessKey::Application(0), vec![7]))
            .unwrap();
        let out = feed(&mut eb, &mut b, now, &transmits(&ea.drain_outputs()));
        assert_eq!(access(&out)[0].iv_index, 8);
    }
}
