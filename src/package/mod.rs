//! Application-level payload carried inside a Sphinx body once it reaches
//! its destination.
//!
//! The reference implementation pickles a tagged Python object and
//! optionally zlib-compresses it. We replace that with a plain bincode
//! enum: self-describing enough for peers running the same build, with no
//! arbitrary-code-execution surface on deserialize. Compression is left out
//! (Non-goal: this crate does not try to shrink model payloads below what
//! fragmentation already produces).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("failed to encode package: {0}")]
    Encode(#[from] bincode::Error),
}

/// What a delivered fragment's payload represents once reassembled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Package {
    /// A slice of a federated-learning model update, opaque to this crate.
    /// The learning collaborator is responsible for chunk/round bookkeeping;
    /// this transport only ever moves the bytes.
    ModelPart(Vec<u8>),
    /// Signals that the sender has finished emitting a training round's
    /// fragments. Present in the original wire format; carried here as a
    /// distinct tag rather than folded into `ModelPart` so a receiver can
    /// tell "no more parts are coming" from "here is another part".
    RoundFinished,
    /// Padding sent solely to keep traffic volume steady; dropped on receipt.
    Cover(Vec<u8>),
}

impl Package {
    pub fn is_cover(&self) -> bool {
        matches!(self, Package::Cover(_))
    }

    pub fn encode(&self) -> Result<Vec<u8>, PackageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PackageError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn cover(len: usize) -> Self {
        use rand_core::{OsRng, RngCore};
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        Package::Cover(bytes)
    }
}
