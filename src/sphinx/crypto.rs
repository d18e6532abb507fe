//! Diffie-Hellman shared secrets and the keys/keystreams derived from them.
//!
//! Every hop on a path shares exactly one secret with the packet's sender:
//! the sender picks a single ephemeral scalar `e` for the whole packet and
//! publishes `e*G` in the header: `pk_hop * e == e * pk_hop` by commutativity
//! of scalar multiplication, so the sender can precompute every hop's secret
//! up front while each hop only ever needs its own static private key plus
//! the one ephemeral point carried in the header.
//!
//! This trades away Sphinx's per-hop key blinding (real Sphinx re-blinds the
//! group element at every hop so intermediate nodes cannot link packets by
//! ephemeral key) for a much simpler construction. Noted in DESIGN.md.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use super::error::SphinxError;
use super::params::MAC_LEN;

type HmacSha256 = Hmac<Sha256>;

pub type SharedSecret = [u8; 32];

/// Generates a fresh ephemeral scalar and its public point for one packet.
pub fn generate_ephemeral() -> (Scalar, RistrettoPoint) {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let scalar = Scalar::from_bytes_mod_order(bytes);
    let point = &scalar * RISTRETTO_BASEPOINT_POINT;
    (scalar, point)
}

pub fn public_from_private(private: &Scalar) -> RistrettoPoint {
    private * RISTRETTO_BASEPOINT_POINT
}

pub fn decompress(bytes: &[u8; 32]) -> Result<RistrettoPoint, SphinxError> {
    CompressedRistretto(*bytes)
        .decompress()
        .ok_or(SphinxError::BadEphemeralKey)
}

/// Shared secret as computed by the sender, for a given hop's public key.
pub fn shared_secret_as_sender(ephemeral: &Scalar, hop_public: &RistrettoPoint) -> SharedSecret {
    (ephemeral * hop_public).compress().to_bytes()
}

/// Shared secret as computed by a hop, from the ephemeral point in the header.
pub fn shared_secret_as_hop(hop_private: &Scalar, ephemeral_point: &RistrettoPoint) -> SharedSecret {
    (hop_private * ephemeral_point).compress().to_bytes()
}

/// Key used to encrypt/decrypt this hop's own routing slot.
pub fn derive_entry_keystream(secret: &SharedSecret, len: usize) -> Vec<u8> {
    derive(secret, "dfl-transport sphinx entry keystream v1", len)
}

/// Key used to cascade-peel one layer of the body.
pub fn derive_body_keystream(secret: &SharedSecret, len: usize) -> Vec<u8> {
    derive(secret, "dfl-transport sphinx body keystream v1", len)
}

/// Key used to authenticate a hop's own slot (the MAC it checks on receipt).
pub fn derive_mac_key(secret: &SharedSecret) -> [u8; 32] {
    let mut out = [0u8; 32];
    blake3::derive_key("dfl-transport sphinx entry mac v1", secret, &mut out);
    out
}

/// Key used for the end-to-end body integrity tag, checked only by the
/// terminal hop (the destination or the SURB originator).
pub fn derive_body_mac_key(secret: &SharedSecret) -> [u8; 32] {
    let mut out = [0u8; 32];
    blake3::derive_key("dfl-transport sphinx body mac v1", secret, &mut out);
    out
}

/// Symmetric key used to seal the small ack payload carried back in a SURB
/// reply, derived from the first hop's secret on the return path.
pub fn derive_surb_ack_key(secret: &SharedSecret) -> [u8; 32] {
    let mut out = [0u8; 32];
    blake3::derive_key("dfl-transport sphinx surb ack v1", secret, &mut out);
    out
}

fn derive(secret: &SharedSecret, context: &str, len: usize) -> Vec<u8> {
    let mut wide = [0u8; 64];
    blake3::derive_key(context, secret, &mut wide);
    if len <= wide.len() {
        wide[..len].to_vec()
    } else {
        // Extend via a running hash chain; routing/body capacities never
        // approach 64 bytes in practice but this keeps the helper honest.
        let mut out = Vec::with_capacity(len);
        let mut block = wide.to_vec();
        while out.len() < len {
            out.extend_from_slice(&block);
            let mut next = [0u8; 64];
            blake3::derive_key(context, &block, &mut next);
            block = next.to_vec();
        }
        out.truncate(len);
        out
    }
}

pub fn xor_in_place(buf: &mut [u8], keystream: &[u8]) {
    for (b, k) in buf.iter_mut().zip(keystream.iter()) {
        *b ^= k;
    }
}

pub fn mac_tag(key: &[u8; 32], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; MAC_LEN];
    tag.copy_from_slice(&full[..MAC_LEN]);
    tag
}

pub fn mac_verify(key: &[u8; 32], data: &[u8], tag: &[u8; MAC_LEN]) -> bool {
    let expected = mac_tag(key, data);
    // Constant-time-ish comparison; MAC_LEN is tiny so this is not a
    // meaningful timing channel, but we avoid short-circuiting on purpose.
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(tag.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_and_hop_agree_on_shared_secret() {
        let hop_private = Scalar::from_bytes_mod_order([7u8; 32]);
        let hop_public = public_from_private(&hop_private);
        let (ephemeral_scalar, ephemeral_point) = generate_ephemeral();

        let at_sender = shared_secret_as_sender(&ephemeral_scalar, &hop_public);
        let at_hop = shared_secret_as_hop(&hop_private, &ephemeral_point);
        assert_eq!(at_sender, at_hop);
    }

    #[test]
    fn mac_roundtrip() {
        let key = [9u8; 32];
        let data = b"routing slot contents";
        let tag = mac_tag(&key, data);
        assert!(mac_verify(&key, data, &tag));
        assert!(!mac_verify(&key, b"tampered", &tag));
    }
}
