//! Sphinx-style onion packet codec: geometry, crypto primitives, the
//! shift-register header, and packet assembly/peeling.

pub mod crypto;
pub mod error;
pub mod header;
pub mod packet;
pub mod params;

pub use error::SphinxError;
pub use header::{PathHop, RoutingCommand, SphinxHeader};
pub use packet::{secure_random_path, PacketCodec, RoutingDecision, SphinxPacket, SurbMaterial};
pub use params::SphinxParams;
