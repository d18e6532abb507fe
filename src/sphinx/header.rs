//! The shift-register routing header.
//!
//! `routing_info` is a flat array of fixed-width slots, one per hop. A hop
//! only ever reads slot zero: it verifies the MAC over that slot using a key
//! only it and the sender share, XOR-decrypts it to learn the command and
//! next hop, then forwards a header with slot zero dropped, the remaining
//! slots shifted down, and one slot of fresh randomness appended at the tail
//! so the header stays a constant `header_len` bytes regardless of how many
//! hops the packet has already crossed.
//!
//! The MAC the next hop will check is not recomputed by the relay: it was
//! placed in the current hop's own slot by the packet's builder, who knows
//! every hop's key up front. The relay just carries it forward.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand_core::{OsRng, RngCore};

use super::crypto::{self, SharedSecret};
use super::error::SphinxError;
use super::params::{SphinxParams, ENTRY_SIZE, MAC_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingCommand {
    Relay,
    Deliver,
    SurbTerminal,
}

impl RoutingCommand {
    fn to_byte(self) -> u8 {
        match self {
            RoutingCommand::Relay => 0x00,
            RoutingCommand::Deliver => 0x01,
            RoutingCommand::SurbTerminal => 0x02,
        }
    }

    fn from_byte(b: u8) -> Result<Self, SphinxError> {
        match b {
            0x00 => Ok(RoutingCommand::Relay),
            0x01 => Ok(RoutingCommand::Deliver),
            0x02 => Ok(RoutingCommand::SurbTerminal),
            other => Err(SphinxError::MalformedCommand(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SphinxHeader {
    pub version: u8,
    pub ephemeral_key: [u8; 32],
    pub mac: [u8; MAC_LEN],
    pub routing_info: Vec<u8>,
}

impl SphinxHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 32 + MAC_LEN + self.routing_info.len());
        out.push(self.version);
        out.extend_from_slice(&self.ephemeral_key);
        out.extend_from_slice(&self.mac);
        out.extend_from_slice(&self.routing_info);
        out
    }

    pub fn from_bytes(params: &SphinxParams, bytes: &[u8]) -> Result<Self, SphinxError> {
        if bytes.len() != params.header_len {
            return Err(SphinxError::WrongPacketLength {
                actual: bytes.len(),
                expected: params.header_len,
            });
        }
        let version = bytes[0];
        let mut ephemeral_key = [0u8; 32];
        ephemeral_key.copy_from_slice(&bytes[1..33]);
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&bytes[33..33 + MAC_LEN]);
        let routing_info = bytes[33 + MAC_LEN..].to_vec();
        Ok(Self { version, ephemeral_key, mac, routing_info })
    }
}

/// One hop on a path as seen by the builder: who it is, and the public key
/// used to derive the secret only that hop can reproduce.
pub struct PathHop {
    pub peer_id: u32,
    pub public_key: RistrettoPoint,
}

/// Builds a full shift-register header for `hops`, the last of which is
/// the terminal (destination or SURB-reply originator). Returns the header
/// plus the per-hop shared secrets in path order, which the caller needs to
/// cascade-encrypt the body.
pub fn build(
    params: &SphinxParams,
    ephemeral_scalar: &Scalar,
    ephemeral_point: &RistrettoPoint,
    hops: &[PathHop],
    terminal: RoutingCommand,
) -> Result<(SphinxHeader, Vec<SharedSecret>), SphinxError> {
    let n = hops.len();
    if n == 0 {
        return Err(SphinxError::EmptyPath);
    }
    if n > params.max_slots() {
        return Err(SphinxError::PathTooLong { len: n, max_slots: params.max_slots() });
    }

    let secrets: Vec<SharedSecret> = hops
        .iter()
        .map(|h| crypto::shared_secret_as_sender(ephemeral_scalar, &h.public_key))
        .collect();

    let mut slot_ciphers: Vec<[u8; ENTRY_SIZE]> = vec![[0u8; ENTRY_SIZE]; n];
    for s in (0..n).rev() {
        let cmd = if s == n - 1 { terminal } else { RoutingCommand::Relay };
        let next_hop = if s < n - 1 { hops[s + 1].peer_id } else { 0u32 };
        let mac_for_next = if s == n - 1 {
            [0u8; MAC_LEN]
        } else {
            let next_key = crypto::derive_mac_key(&secrets[s + 1]);
            crypto::mac_tag(&next_key, &slot_ciphers[s + 1])
        };

        let mut plain = [0u8; ENTRY_SIZE];
        plain[0] = cmd.to_byte();
        plain[1..5].copy_from_slice(&next_hop.to_be_bytes());
        plain[5..5 + MAC_LEN].copy_from_slice(&mac_for_next);

        let keystream = crypto::derive_entry_keystream(&secrets[s], ENTRY_SIZE);
        crypto::xor_in_place(&mut plain, &keystream);
        slot_ciphers[s] = plain;
    }

    let capacity = params.routing_capacity();
    let mut routing_info = Vec::with_capacity(capacity);
    for cipher in &slot_ciphers {
        routing_info.extend_from_slice(cipher);
    }
    let mut tail = vec![0u8; capacity - routing_info.len()];
    OsRng.fill_bytes(&mut tail);
    routing_info.extend_from_slice(&tail);

    let top_mac_key = crypto::derive_mac_key(&secrets[0]);
    let mac = crypto::mac_tag(&top_mac_key, &slot_ciphers[0]);

    let header = SphinxHeader {
        version: 1,
        ephemeral_key: ephemeral_point.compress().to_bytes(),
        mac,
        routing_info,
    };
    Ok((header, secrets))
}

pub struct PeelResult {
    pub command: RoutingCommand,
    pub next_hop: Option<u32>,
    pub secret: SharedSecret,
    pub forwarded_header: Option<SphinxHeader>,
}

/// Removes exactly one layer of the header, as the hop holding `self_private`.
pub fn peel(params: &SphinxParams, header: &SphinxHeader, self_private: &Scalar) -> Result<PeelResult, SphinxError> {
    let ephemeral_point = crypto::decompress(&header.ephemeral_key)?;
    let secret = crypto::shared_secret_as_hop(self_private, &ephemeral_point);

    if header.routing_info.len() < ENTRY_SIZE {
        return Err(SphinxError::HeaderTooSmall {
            header_len: params.header_len,
            min_slots: 1,
            available_slots: 0,
        });
    }
    let own_cipher = &header.routing_info[..ENTRY_SIZE];

    let mac_key = crypto::derive_mac_key(&secret);
    let mut own_cipher_arr = [0u8; ENTRY_SIZE];
    own_cipher_arr.copy_from_slice(own_cipher);
    if !crypto::mac_verify(&mac_key, own_cipher, &header.mac) {
        return Err(SphinxError::InvalidMac);
    }

    let keystream = crypto::derive_entry_keystream(&secret, ENTRY_SIZE);
    let mut plain = own_cipher_arr;
    crypto::xor_in_place(&mut plain, &keystream);

    let command = RoutingCommand::from_byte(plain[0])?;
    let mut next_hop_bytes = [0u8; 4];
    next_hop_bytes.copy_from_slice(&plain[1..5]);
    let next_hop = u32::from_be_bytes(next_hop_bytes);
    let mut mac_for_next = [0u8; MAC_LEN];
    mac_for_next.copy_from_slice(&plain[5..5 + MAC_LEN]);

    let forwarded_header = match command {
        RoutingCommand::Relay => {
            let mut routing_info = header.routing_info[ENTRY_SIZE..].to_vec();
            let mut tail = vec![0u8; ENTRY_SIZE];
            OsRng.fill_bytes(&mut tail);
            routing_info.extend_from_slice(&tail);
            Some(SphinxHeader {
                version: header.version,
                ephemeral_key: header.ephemeral_key,
                mac: mac_for_next,
                routing_info,
            })
        }
        RoutingCommand::Deliver | RoutingCommand::SurbTerminal => None,
    };

    Ok(PeelResult {
        command,
        next_hop: if matches!(command, RoutingCommand::Relay) { Some(next_hop) } else { None },
        secret,
        forwarded_header,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sphinx::crypto::{generate_ephemeral, public_from_private};

    fn hop(id: u32, seed: u8) -> (Scalar, PathHop) {
        let private = Scalar::from_bytes_mod_order([seed; 32]);
        let public_key = public_from_private(&private);
        (private, PathHop { peer_id: id, public_key })
    }

    #[test]
    fn three_hop_path_peels_in_order() {
        let params = SphinxParams::default();
        let (priv1, hop1) = hop(1, 1);
        let (priv2, hop2) = hop(2, 2);
        let (priv3, hop3) = hop(3, 3);
        let (ephemeral_scalar, ephemeral_point) = generate_ephemeral();

        let (header, _secrets) = build(
            &params,
            &ephemeral_scalar,
            &ephemeral_point,
            &[hop1, hop2, hop3],
            RoutingCommand::Deliver,
        )
        .unwrap();

        let step1 = peel(&params, &header, &priv1).unwrap();
        assert_eq!(step1.next_hop, Some(2));
        assert!(matches!(step1.command, RoutingCommand::Relay));
        let header2 = step1.forwarded_header.unwrap();

        let step2 = peel(&params, &header2, &priv2).unwrap();
        assert_eq!(step2.next_hop, Some(3));
        let header3 = step2.forwarded_header.unwrap();

        let step3 = peel(&params, &header3, &priv3).unwrap();
        assert!(matches!(step3.command, RoutingCommand::Deliver));
        assert!(step3.forwarded_header.is_none());
    }

    #[test]
    fn wrong_private_key_fails_mac() {
        let params = SphinxParams::default();
        let (_priv1, hop1) = hop(1, 1);
        let (wrong_priv, _) = hop(99, 99);
        let (ephemeral_scalar, ephemeral_point) = generate_ephemeral();

        let (header, _) = build(&params, &ephemeral_scalar, &ephemeral_point, &[hop1], RoutingCommand::Deliver).unwrap();
        let result = peel(&params, &header, &wrong_priv);
        assert!(matches!(result, Err(SphinxError::InvalidMac)));
    }

    #[test]
    fn path_longer_than_capacity_is_rejected() {
        let params = SphinxParams::default();
        let max = params.max_slots();
        let hops: Vec<PathHop> = (0..max as u32 + 1)
            .map(|i| hop(i, i as u8 + 1).1)
            .collect();
        let (ephemeral_scalar, ephemeral_point) = generate_ephemeral();
        let result = build(&params, &ephemeral_scalar, &ephemeral_point, &hops, RoutingCommand::Deliver);
        assert!(matches!(result, Err(SphinxError::PathTooLong { .. })));
    }
}
