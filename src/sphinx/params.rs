//! Fixed geometry of the onion packet format.
//!
//! Every size in this module is derived once from [`SphinxParams`] and then
//! held constant for the lifetime of a node: all packets on the wire are
//! `header_len + body_len` bytes, and the header's routing block is sliced
//! into fixed-width "slots" (see `sphinx::header`), one per hop the packet
//! can still travel through.

use serde::{Deserialize, Serialize};

/// Truncated-MAC length used for both the per-hop header chain and the
/// end-to-end body integrity tag. 16 bytes (HMAC-SHA256-128) is a standard
/// truncation that keeps slots small without giving up meaningful collision
/// resistance for an in-process routing check.
pub const MAC_LEN: usize = 16;

/// Bytes reserved in a routing slot for the hop command and the next-hop id.
const SLOT_HEADER_LEN: usize = 1 + 4;

/// Total size of one shift-register slot: command + next-hop id + the MAC
/// the holder should present when it forwards to the next hop.
pub const ENTRY_SIZE: usize = SLOT_HEADER_LEN + MAC_LEN;

/// Fixed overhead in every header: a version byte, the sender's ephemeral
/// Ristretto point (compressed, 32 bytes), and the current hop's MAC.
const HEADER_FIXED_OVERHEAD: usize = 1 + 32 + MAC_LEN;

/// Immutable geometry shared by every peer. Loaded once from configuration;
/// never mutated after that (mirrors spec.md's "Immutable tuple" framing).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SphinxParams {
    pub header_len: usize,
    pub body_len: usize,
    pub symmetric_key_len: usize,
    /// Length of a SURB id, reused as the destination-marker width the
    /// reference Sphinx construction calls `dest_len`.
    pub dest_len: usize,
}

impl Default for SphinxParams {
    fn default() -> Self {
        Self {
            header_len: 192,
            body_len: 1024,
            symmetric_key_len: 32,
            dest_len: 16,
        }
    }
}

impl SphinxParams {
    /// Constant on-wire packet size: every frame PeerLink reads or writes is
    /// exactly this many bytes.
    pub fn packet_len(&self) -> usize {
        self.header_len + self.body_len
    }

    /// Bytes available for the shift-register routing block once the fixed
    /// header overhead (version + ephemeral key + MAC) is subtracted.
    pub fn routing_capacity(&self) -> usize {
        self.header_len.saturating_sub(HEADER_FIXED_OVERHEAD)
    }

    /// How many hops (including the destination/terminal slot) a single
    /// header can carry. This is a hard ceiling on path length: a header
    /// cannot describe a path longer than its own routing capacity.
    pub fn max_slots(&self) -> usize {
        self.routing_capacity() / ENTRY_SIZE
    }

    /// Bytes available in the body for the end-to-end payload once the
    /// body-level integrity tag is subtracted.
    pub fn body_capacity(&self) -> usize {
        self.body_len.saturating_sub(MAC_LEN)
    }

    pub fn validate(&self) -> Result<(), crate::sphinx::SphinxError> {
        if self.max_slots() < 2 {
            return Err(crate::sphinx::SphinxError::HeaderTooSmall {
                header_len: self.header_len,
                min_slots: 2,
                available_slots: self.max_slots(),
            });
        }
        if self.body_capacity() == 0 {
            return Err(crate::sphinx::SphinxError::BodyTooSmall { body_len: self.body_len });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_wire_size() {
        let params = SphinxParams::default();
        assert_eq!(params.packet_len(), 1216);
    }

    #[test]
    fn routing_capacity_supports_several_hops() {
        let params = SphinxParams::default();
        assert!(params.max_slots() >= 4, "max_slots = {}", params.max_slots());
    }
}
