//! Long-term key material: this node's own private scalar, and the public
//! keys of every peer it might route through.
//!
//! On disk the two halves are separate files, mirroring the reference
//! implementation's split between a private-key pickle readable only by the
//! owning node and a public-key pickle shared out of band to every peer.
//! We use bincode instead of pickle: it is a real, widely used Rust
//! serialization format rather than a language-specific one, and needs no
//! trust in the deserializer beyond what bincode itself provides.

use std::collections::HashMap;
use std::path::Path;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::PeerId;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to read key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode key file {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: bincode::Error,
    },
    #[error("no private key on record for this node")]
    MissingSelf,
    #[error("stored public key for peer {0} does not decompress to a curve point")]
    Corrupt(PeerId),
}

#[derive(Serialize, Deserialize)]
struct PrivateKeyFile {
    scalar_bytes: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct PublicKeyFile {
    keys: HashMap<PeerId, [u8; 32]>,
}

pub struct KeyStore {
    self_private: Option<Scalar>,
    public_keys: HashMap<PeerId, RistrettoPoint>,
}

impl KeyStore {
    /// Loads the node's own private key and the network's public key table
    /// from the two bincode files produced by [`generate_network_keys`].
    pub fn load(priv_path: &Path, pub_path: &Path) -> Result<Self, KeyStoreError> {
        let priv_bytes = std::fs::read(priv_path).map_err(|source| KeyStoreError::Io {
            path: priv_path.display().to_string(),
            source,
        })?;
        let priv_file: PrivateKeyFile = bincode::deserialize(&priv_bytes).map_err(|source| KeyStoreError::Decode {
            path: priv_path.display().to_string(),
            source,
        })?;
        let self_private = Scalar::from_canonical_bytes(priv_file.scalar_bytes)
            .into_option()
            .unwrap_or_else(|| Scalar::from_bytes_mod_order(priv_file.scalar_bytes));

        let pub_bytes = std::fs::read(pub_path).map_err(|source| KeyStoreError::Io {
            path: pub_path.display().to_string(),
            source,
        })?;
        let pub_file: PublicKeyFile = bincode::deserialize(&pub_bytes).map_err(|source| KeyStoreError::Decode {
            path: pub_path.display().to_string(),
            source,
        })?;

        let mut public_keys = HashMap::with_capacity(pub_file.keys.len());
        for (peer_id, bytes) in pub_file.keys {
            let point = CompressedRistretto(bytes)
                .decompress()
                .ok_or(KeyStoreError::Corrupt(peer_id))?;
            public_keys.insert(peer_id, point);
        }

        info!(peers = public_keys.len(), "loaded key store");
        Ok(Self { self_private: Some(self_private), public_keys })
    }

    /// Builds a key store directly from a public-key map, without any
    /// private key of our own. Used by components (like the SURB builder in
    /// tests) that only need to look up peers' public keys.
    pub fn from_public_map(public_keys: HashMap<PeerId, RistrettoPoint>) -> Self {
        Self { self_private: None, public_keys }
    }

    pub fn with_self_private(mut self, private: Scalar) -> Self {
        self.self_private = Some(private);
        self
    }

    pub fn self_private(&self) -> Result<Scalar, KeyStoreError> {
        self.self_private.ok_or(KeyStoreError::MissingSelf)
    }

    pub fn public_of(&self, peer_id: PeerId) -> Option<RistrettoPoint> {
        self.public_keys.get(&peer_id).copied()
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.public_keys.keys().copied().collect()
    }
}

/// Generates a fresh private scalar for `node_id` and writes both key files
/// for a network of `n_nodes` nodes, returning the full set of private
/// scalars (so a test harness or a one-shot local cluster bootstrap can
/// write every node's private file from a single process).
pub fn generate_network_keys(n_nodes: u32) -> Vec<(PeerId, Scalar, RistrettoPoint)> {
    (0..n_nodes)
        .map(|id| {
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            let scalar = Scalar::from_bytes_mod_order(bytes);
            let public = crate::sphinx::crypto::public_from_private(&scalar);
            (id, scalar, public)
        })
        .collect()
}

pub fn write_private_key_file(path: &Path, scalar: &Scalar) -> Result<(), KeyStoreError> {
    let file = PrivateKeyFile { scalar_bytes: scalar.to_bytes() };
    let bytes = bincode::serialize(&file).map_err(|source| KeyStoreError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::write(path, bytes).map_err(|source| KeyStoreError::Io { path: path.display().to_string(), source })
}

pub fn write_public_key_file(path: &Path, keys: &[(PeerId, RistrettoPoint)]) -> Result<(), KeyStoreError> {
    let map = keys.iter().map(|(id, pt)| (*id, pt.compress().to_bytes())).collect();
    let file = PublicKeyFile { keys: map };
    let bytes = bincode::serialize(&file).map_err(|source| KeyStoreError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::write(path, bytes).map_err(|source| KeyStoreError::Io { path: path.display().to_string(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("dfl-keystore-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let keys = generate_network_keys(3);

        let priv_path = dir.join("node0.priv");
        let pub_path = dir.join("network.pub");
        write_private_key_file(&priv_path, &keys[0].1).unwrap();
        let public_list: Vec<(PeerId, RistrettoPoint)> = keys.iter().map(|(id, _, pk)| (*id, *pk)).collect();
        write_public_key_file(&pub_path, &public_list).unwrap();

        let store = KeyStore::load(&priv_path, &pub_path).unwrap();
        assert_eq!(store.self_private().unwrap(), keys[0].1);
        assert_eq!(store.public_of(1), Some(keys[1].2));
        assert_eq!(store.public_of(99), None);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
