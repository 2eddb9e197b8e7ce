//! Basic usage example for the mesh PDU codecs.

use mesh_crypto::derive_network_keys;
use mesh_wire::{
    decode_network_pdu, encode_network_pdu, AccessPdu, LowerTransportPdu, NetworkHeader, Opcode,
    ProxyPduType, ProxyReassembler, ProxySegmenter, RawNetworkPdu,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Mesh PDU Codec Example ===\n");

    // 1. An access message: Generic OnOff Get
    let access = AccessPdu::new(Opcode::Double(0x8201), Vec::new());
    println!("1. Access PDU: {:02x?}", access.encode()?.as_ref());

    // 2. Wrap a control message in a network PDU
    let keys = derive_network_keys(&[0x7D; 16])?;
    let header = NetworkHeader {
        ctl: true,
        ttl: 5,
        seq: 42,
        src: 0x0001,
        dst: 0x1201,
    };
    let lower = LowerTransportPdu::UnsegmentedControl {
        opcode: 0x0A,
        parameters: bytes::Bytes::from_static(&[0x01, 0x02]),
    };
    let network = encode_network_pdu(&header, &lower.encode()?, &keys, 0)?;
    println!("2. Network PDU ({} bytes): {:02x?}", network.len(), network.as_ref());

    // 3. Decode it again
    let raw = RawNetworkPdu::decode(&network)?;
    let (decoded, transport) = decode_network_pdu(&raw, &keys, 0)?;
    println!("3. Decoded header: {:?}", decoded);
    println!("   Lower PDU: {:?}", LowerTransportPdu::decode(decoded.ctl, &transport)?);

    // 4. Carry it over a 20-byte GATT MTU
    let segmenter = ProxySegmenter::new(20)?;
    let writes = segmenter.segment(ProxyPduType::NetworkPdu, &network);
    let mut reassembler = ProxyReassembler::new();
    for w in &writes {
        if let Some((ty, msg)) = reassembler.push(w)? {
            println!("4. Reassembled {:?} from {} writes ({} bytes)", ty, writes.len(), msg.len());
        }
    }

    Ok(())
}
