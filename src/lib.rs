//! A peer-to-peer transport that moves application bytes between a fixed
//! set of peers without a middle box learning who talked to whom: Sphinx
//! onion packets carrying SURB-based return paths, a Poisson-ish mixer to
//! decouple send timing from arrival timing, and one long-lived TCP stream
//! per peer.
//!
//! The crate is a library; [`transport::Transport`] is the one type most
//! callers need. `bin/peer.rs` is a thin binary that wires a loaded
//! [`config::TransportConfig`] into a running `Transport` plus its
//! background clock loops.

pub mod cli;
pub mod clock;
pub mod config;
pub mod fragment_cache;
pub mod keystore;
pub mod logging;
pub mod metrics;
pub mod mixer;
pub mod package;
pub mod peerlink;
pub mod session_switch;
pub mod sphinx;
pub mod transport;

/// Identifies a peer within the fixed network given at startup. Peers are
/// numbered `0..n_nodes`; there is no dynamic peer discovery (Non-goal), so
/// this is just a dense index rather than a public key or address.
pub type PeerId = u32;
