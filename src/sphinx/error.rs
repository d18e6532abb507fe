use thiserror::Error;

#[derive(Debug, Error)]
pub enum SphinxError {
    #[error("header_len {header_len} gives only {available_slots} routing slots, need at least {min_slots}")]
    HeaderTooSmall {
        header_len: usize,
        min_slots: usize,
        available_slots: usize,
    },

    #[error("body_len {body_len} leaves no room for payload after the integrity tag")]
    BodyTooSmall { body_len: usize },

    #[error("path has {len} hops, which exceeds this header's capacity of {max_slots} slots")]
    PathTooLong { len: usize, max_slots: usize },

    #[error("path must contain at least a destination")]
    EmptyPath,

    #[error("packet is {actual} bytes, expected {expected}")]
    WrongPacketLength { actual: usize, expected: usize },

    #[error("header MAC verification failed, packet dropped")]
    InvalidMac,

    #[error("body MAC verification failed, packet dropped")]
    InvalidBodyMac,

    #[error("malformed routing command byte {0:#04x}")]
    MalformedCommand(u8),

    #[error("no public key on record for peer {0}")]
    UnknownPeer(u32),

    #[error("failed to decompress ephemeral key in header")]
    BadEphemeralKey,

    #[error("payload encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("surb encryption error: {0}")]
    SurbCrypto(String),
}
