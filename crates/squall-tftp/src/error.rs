use thiserror::Error;

use crate::packet::ErrorCode;

#[derive(Error, Debug)]
pub enum TftpError {
    /// Datagram that cannot be decoded. Dropped without a reply.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Unexpected opcode or block number outside the tolerated
    /// duplicate window.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No datagram arrived within the per-block deadline. Recoverable
    /// until the retry budget runs out.
    #[error("timed out waiting for peer")]
    Timeout,

    /// Retry budget exhausted for one block. Fatal to the session.
    #[error("retry budget exhausted at block {block}")]
    RetryExhausted { block: u16 },

    /// Lock registry at capacity. Fatal, surfaced to the peer as ERROR.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Terminal ERROR packet received from the remote endpoint.
    #[error("peer error {code:?}: {message}")]
    Peer { code: ErrorCode, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;
