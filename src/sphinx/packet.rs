//! Packet assembly, onion peeling, and SURB reply construction.
//!
//! A [`SphinxPacket`] is always exactly `params.packet_len()` bytes: a
//! shift-register header (see `sphinx::header`) followed by a body that is
//! cascade-XOR-encrypted once per hop on the path. Unlike the header, the
//! body never shifts: every hop removes exactly one XOR term and forwards
//! the same number of bytes, so only the final hop (destination or SURB
//! originator) ever sees plaintext.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use super::crypto::{self, SharedSecret};
use super::error::SphinxError;
use super::header::{self, PathHop, RoutingCommand, SphinxHeader};
use super::params::{SphinxParams, MAC_LEN};
use crate::keystore::KeyStore;
use crate::PeerId;
use curve25519_dalek::scalar::Scalar;

impl Serialize for SphinxHeader {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.version, self.ephemeral_key, self.mac, &self.routing_info).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SphinxHeader {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (version, ephemeral_key, mac, routing_info) =
            <(u8, [u8; 32], [u8; MAC_LEN], Vec<u8>)>::deserialize(deserializer)?;
        Ok(Self { version, ephemeral_key, mac, routing_info })
    }
}

#[derive(Debug, Clone)]
pub struct SphinxPacket {
    pub header: SphinxHeader,
    pub body: Vec<u8>,
}

impl SphinxPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header.to_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    pub fn from_bytes(params: &SphinxParams, bytes: &[u8]) -> Result<Self, SphinxError> {
        if bytes.len() != params.packet_len() {
            return Err(SphinxError::WrongPacketLength { actual: bytes.len(), expected: params.packet_len() });
        }
        let header = SphinxHeader::from_bytes(params, &bytes[..params.header_len])?;
        let body = bytes[params.header_len..].to_vec();
        Ok(Self { header, body })
    }
}

/// The opaque return-path token embedded in a forward message. Holds the
/// prebuilt reply header plus the per-hop secrets the replier needs to seal
/// a body for that path; it never exposes any hop's private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurbMaterial {
    pub header: SphinxHeader,
    pub secrets: Vec<[u8; 32]>,
    /// The peer this packet must be handed to first. The replier never
    /// learns the rest of the return path, but the network still needs to
    /// know where to physically send the sealed packet.
    pub first_hop: PeerId,
}

pub enum RoutingDecision {
    Relay { next_peer_id: PeerId, next_packet_bytes: Vec<u8> },
    Deliver { payload: Vec<u8>, surb: Option<(Vec<u8>, SurbMaterial)>, mac_key: SharedSecret },
    SurbTerminal { surb_id: Vec<u8>, encrypted_reply: Vec<u8> },
}

#[derive(Serialize, Deserialize)]
struct DeliverPayload {
    surb_id: Vec<u8>,
    surb_material: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SurbTerminalPayload {
    surb_id: Vec<u8>,
    reply: Vec<u8>,
}

/// Builds and peels packets for one node. Owns the node's long-term private
/// key; everything else (path selection inputs, public keys) comes from the
/// [`KeyStore`] passed to each call.
pub struct PacketCodec {
    pub params: SphinxParams,
    self_id: PeerId,
    self_private: Scalar,
}

impl PacketCodec {
    pub fn new(params: SphinxParams, self_id: PeerId, self_private: Scalar) -> Result<Self, SphinxError> {
        params.validate()?;
        Ok(Self { params, self_id, self_private })
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    fn hops_for(&self, keystore: &KeyStore, path: &[PeerId]) -> Result<Vec<PathHop>, SphinxError> {
        path.iter()
            .map(|id| {
                let public_key = keystore.public_of(*id).ok_or(SphinxError::UnknownPeer(*id))?;
                Ok(PathHop { peer_id: *id, public_key })
            })
            .collect()
    }

    /// Builds a forward message addressed to `forward_path`'s last hop,
    /// embedding a SURB built over `return_path` (whose last hop must be
    /// this node) so the destination can ack without knowing our address.
    pub fn build_forward(
        &self,
        keystore: &KeyStore,
        forward_path: &[PeerId],
        return_path: &[PeerId],
        payload: &[u8],
    ) -> Result<(SphinxPacket, Vec<u8>, SurbMaterial), SphinxError> {
        let fwd_hops = self.hops_for(keystore, forward_path)?;
        let (fwd_ephemeral_scalar, fwd_ephemeral_point) = crypto::generate_ephemeral();
        let (header, fwd_secrets) =
            header::build(&self.params, &fwd_ephemeral_scalar, &fwd_ephemeral_point, &fwd_hops, RoutingCommand::Deliver)?;

        let ret_hops = self.hops_for(keystore, return_path)?;
        let first_hop = ret_hops.first().ok_or(SphinxError::EmptyPath)?.peer_id;
        let (ret_ephemeral_scalar, ret_ephemeral_point) = crypto::generate_ephemeral();
        let (return_header, ret_secrets) =
            header::build(&self.params, &ret_ephemeral_scalar, &ret_ephemeral_point, &ret_hops, RoutingCommand::SurbTerminal)?;

        let mut surb_id = vec![0u8; self.params.dest_len];
        OsRng.fill_bytes(&mut surb_id);

        let surb_material = SurbMaterial { header: return_header, secrets: ret_secrets, first_hop };
        let surb_material_bytes = bincode::serialize(&surb_material)?;

        let deliver = DeliverPayload {
            surb_id: surb_id.clone(),
            surb_material: Some(surb_material_bytes),
            payload: payload.to_vec(),
        };
        let body = self.seal_body(&deliver, &fwd_secrets)?;

        Ok((SphinxPacket { header, body }, surb_id, surb_material))
    }

    /// Builds a reply packet using a SURB handed to us in someone else's
    /// forward message. We never learn the originator's identity: only the
    /// prebuilt header and the keys needed to seal this body for it.
    pub fn build_surb_reply(&self, surb: &SurbMaterial, surb_id: &[u8], reply: &[u8]) -> Result<SphinxPacket, SphinxError> {
        let content = SurbTerminalPayload { surb_id: surb_id.to_vec(), reply: reply.to_vec() };
        let bytes = bincode::serialize(&content)?;
        let body = self.seal_body_bytes(bytes, &surb.secrets)?;
        Ok(SphinxPacket { header: surb.header.clone(), body })
    }

    fn seal_body<T: Serialize>(&self, content: &T, secrets: &[SharedSecret]) -> Result<Vec<u8>, SphinxError> {
        let bytes = bincode::serialize(content)?;
        self.seal_body_bytes(bytes, secrets)
    }

    fn seal_body_bytes(&self, mut bytes: Vec<u8>, secrets: &[SharedSecret]) -> Result<Vec<u8>, SphinxError> {
        let capacity = self.params.body_capacity();
        if bytes.len() > capacity {
            return Err(SphinxError::BodyTooSmall { body_len: self.params.body_len });
        }
        bytes.resize(capacity, 0);

        let terminal_secret = secrets.last().ok_or(SphinxError::EmptyPath)?;
        let mac = crypto::mac_tag(&crypto::derive_body_mac_key(terminal_secret), &bytes);

        for secret in secrets {
            let keystream = crypto::derive_body_keystream(secret, capacity);
            crypto::xor_in_place(&mut bytes, &keystream);
        }

        let mut out = Vec::with_capacity(MAC_LEN + capacity);
        out.extend_from_slice(&mac);
        out.extend_from_slice(&bytes);
        Ok(out)
    }

    /// Peels exactly one hop off `packet_bytes`: verifies the header MAC,
    /// strips one body XOR layer, and returns what this hop should do next.
    pub fn process_inbound(&self, packet_bytes: &[u8]) -> Result<RoutingDecision, SphinxError> {
        let packet = SphinxPacket::from_bytes(&self.params, packet_bytes)?;
        let peel = header::peel(&self.params, &packet.header, &self.self_private)?;

        let capacity = self.params.body_capacity();
        if packet.body.len() != MAC_LEN + capacity {
            return Err(SphinxError::WrongPacketLength { actual: packet.body.len(), expected: MAC_LEN + capacity });
        }
        let mut body_mac = [0u8; MAC_LEN];
        body_mac.copy_from_slice(&packet.body[..MAC_LEN]);
        let mut content = packet.body[MAC_LEN..].to_vec();
        let keystream = crypto::derive_body_keystream(&peel.secret, capacity);
        crypto::xor_in_place(&mut content, &keystream);

        match peel.command {
            RoutingCommand::Relay => {
                let next_header = peel.forwarded_header.expect("relay always carries a forwarded header");
                let mut next_body = Vec::with_capacity(MAC_LEN + capacity);
                next_body.extend_from_slice(&body_mac);
                next_body.extend_from_slice(&content);
                let next_packet = SphinxPacket { header: next_header, body: next_body };
                Ok(RoutingDecision::Relay {
                    next_peer_id: peel.next_hop.expect("relay always has a next hop"),
                    next_packet_bytes: next_packet.to_bytes(),
                })
            }
            RoutingCommand::Deliver => {
                if !crypto::mac_verify(&crypto::derive_body_mac_key(&peel.secret), &content, &body_mac) {
                    return Err(SphinxError::InvalidBodyMac);
                }
                let deliver: DeliverPayload = bincode::deserialize(&content)?;
                let surb = match deliver.surb_material {
                    Some(bytes) => Some((deliver.surb_id, bincode::deserialize::<SurbMaterial>(&bytes)?)),
                    None => None,
                };
                Ok(RoutingDecision::Deliver { payload: deliver.payload, surb, mac_key: peel.secret })
            }
            RoutingCommand::SurbTerminal => {
                if !crypto::mac_verify(&crypto::derive_body_mac_key(&peel.secret), &content, &body_mac) {
                    return Err(SphinxError::InvalidBodyMac);
                }
                let terminal: SurbTerminalPayload = bincode::deserialize(&content)?;
                Ok(RoutingDecision::SurbTerminal { surb_id: terminal.surb_id, encrypted_reply: terminal.reply })
            }
        }
    }
}

/// Uniformly selects a path of random length in `[0, max_hops]` intermediates
/// (no repeats, never `self_id` or `destination_id`), terminated by
/// `destination_id`. Mirrors the original's choice of a CSPRNG for both the
/// path length and each hop: this is routing metadata, not a value any hop
/// needs to keep secret from itself.
pub fn secure_random_path(n_nodes: u32, self_id: PeerId, destination_id: PeerId, max_hops: usize) -> Vec<PeerId> {
    let mut candidates: Vec<PeerId> = (0..n_nodes).filter(|&id| id != self_id && id != destination_id).collect();

    let len = if candidates.is_empty() || max_hops == 0 {
        0
    } else {
        (OsRng.next_u32() as usize) % (max_hops.min(candidates.len()) + 1)
    };

    let mut path = Vec::with_capacity(len + 1);
    for _ in 0..len {
        let idx = (OsRng.next_u32() as usize) % candidates.len();
        path.push(candidates.swap_remove(idx));
    }
    path.push(destination_id);
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeyStore;
    use curve25519_dalek::scalar::Scalar;

    fn build_keystore(ids: &[PeerId]) -> (KeyStore, Vec<Scalar>) {
        let mut privates = Vec::new();
        let mut pairs = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let private = Scalar::from_bytes_mod_order([i as u8 + 10; 32]);
            let public = crypto::public_from_private(&private);
            pairs.push((*id, public));
            privates.push(private);
        }
        (KeyStore::from_public_map(pairs.into_iter().collect()), privates)
    }

    #[test]
    fn direct_delivery_round_trips_payload() {
        let params = SphinxParams::default();
        let ids = [0u32, 1u32];
        let (keystore, privates) = build_keystore(&ids);

        let sender = PacketCodec::new(params, 0, privates[0]).unwrap();
        let receiver = PacketCodec::new(params, 1, privates[1]).unwrap();

        let (packet, surb_id, _material) = sender.build_forward(&keystore, &[1], &[0], b"hello").unwrap();
        let decision = receiver.process_inbound(&packet.to_bytes()).unwrap();
        match decision {
            RoutingDecision::Deliver { payload, surb, .. } => {
                assert_eq!(payload, b"hello");
                let (got_surb_id, _material) = surb.unwrap();
                assert_eq!(got_surb_id, surb_id);
            }
            _ => panic!("expected Deliver"),
        }
    }

    #[test]
    fn relay_hop_forwards_without_reading_payload() {
        let params = SphinxParams::default();
        let ids = [0u32, 1u32, 2u32];
        let (keystore, privates) = build_keystore(&ids);

        let sender = PacketCodec::new(params, 0, privates[0]).unwrap();
        let relay = PacketCodec::new(params, 1, privates[1]).unwrap();
        let receiver = PacketCodec::new(params, 2, privates[2]).unwrap();

        let (packet, _surb_id, _material) = sender.build_forward(&keystore, &[1, 2], &[1, 0], b"payload").unwrap();
        let at_relay = relay.process_inbound(&packet.to_bytes()).unwrap();
        let forwarded = match at_relay {
            RoutingDecision::Relay { next_peer_id, next_packet_bytes } => {
                assert_eq!(next_peer_id, 2);
                next_packet_bytes
            }
            _ => panic!("expected Relay"),
        };
        let at_dest = receiver.process_inbound(&forwarded).unwrap();
        assert!(matches!(at_dest, RoutingDecision::Deliver { .. }));
    }

    #[test]
    fn surb_reply_reaches_originator() {
        let params = SphinxParams::default();
        let ids = [0u32, 1u32];
        let (keystore, privates) = build_keystore(&ids);

        let sender = PacketCodec::new(params, 0, privates[0]).unwrap();
        let receiver = PacketCodec::new(params, 1, privates[1]).unwrap();

        let (packet, surb_id, _material) = sender.build_forward(&keystore, &[1], &[0], b"ping").unwrap();
        let (_, surb) = match receiver.process_inbound(&packet.to_bytes()).unwrap() {
            RoutingDecision::Deliver { surb, .. } => surb.unwrap(),
            _ => panic!("expected Deliver"),
        };

        let reply_packet = receiver.build_surb_reply(&surb, &surb_id, b"ack").unwrap();
        match sender.process_inbound(&reply_packet.to_bytes()).unwrap() {
            RoutingDecision::SurbTerminal { surb_id: got, .. } => assert_eq!(got, surb_id),
            _ => panic!("expected SurbTerminal"),
        }
    }

    #[test]
    fn corrupted_header_mac_is_rejected() {
        let params = SphinxParams::default();
        let ids = [0u32, 1u32];
        let (keystore, privates) = build_keystore(&ids);
        let sender = PacketCodec::new(params, 0, privates[0]).unwrap();
        let receiver = PacketCodec::new(params, 1, privates[1]).unwrap();

        let (packet, _, _material) = sender.build_forward(&keystore, &[1], &[0], b"x").unwrap();
        let mut bytes = packet.to_bytes();
        bytes[40] ^= 0xFF;
        let result = receiver.process_inbound(&bytes);
        assert!(matches!(result, Err(SphinxError::InvalidMac)));
    }
}
