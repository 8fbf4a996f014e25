//! A TFTP-style reliable file-transfer engine over UDP.
//!
//! A client asks to read (RRQ) or write (WRQ) a named file in a given
//! transfer mode; the endpoints then exchange fixed-size DATA blocks
//! acknowledged one at a time, with timeout-driven retransmission,
//! 16-bit block sequencing, OACK-style option negotiation (block size
//! and extended "bigfile" numbering) and netascii line-ending
//! transcoding. Each transfer runs on its own ephemeral socket in its
//! own task; transfers touching the same filename serialize through a
//! process-wide lock registry.

pub mod client;
pub mod config;
pub mod error;
pub mod locks;
pub mod netascii;
pub mod options;
pub mod packet;
pub mod server;
pub mod transfer;

/// RFC 1350 standard block size.
pub const DEFAULT_BLOCK_SIZE: usize = 512;
/// RFC 2348 maximum negotiable block size.
pub const MAX_BLOCK_SIZE: usize = 65464;
/// Largest datagram the engine will ever produce: max block + 4 byte header.
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub use client::TftpClient;
pub use error::{Result, TftpError};
pub use packet::{ErrorCode, Opcode, Packet, Request, TransferMode};
pub use server::TftpServer;
