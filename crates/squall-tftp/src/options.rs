//! Capability negotiation on the trailing option/value pairs of a request.
//!
//! The server accepts a subset of requested options and answers with an
//! OACK naming exactly the accepted ones, in request order, in place of
//! the first ACK/DATA. A request with no recognized options proceeds as
//! the baseline stop-and-wait exchange.

use tracing::debug;

use crate::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};

pub const OPTION_BLKSIZE: &str = "blksize";
pub const OPTION_BIGFILE: &str = "bigfile";

/// The values both endpoints agreed on for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedOptions {
    /// Maximum payload bytes per DATA packet.
    pub block_size: usize,
    /// Extended block counting: the internal counter is 32-bit and the
    /// 16-bit wire field wraps instead of capping the transfer length.
    pub bigfile: bool,
}

impl Default for NegotiatedOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            bigfile: false,
        }
    }
}

impl NegotiatedOptions {
    /// Apply a client-side OACK. Accepted values the client never asked
    /// for are ignored.
    pub fn apply_oack(&mut self, accepted: &[(String, String)]) {
        for (name, value) in accepted {
            match name.to_lowercase().as_str() {
                OPTION_BLKSIZE => {
                    if let Ok(size) = value.parse::<usize>() {
                        if (8..=MAX_BLOCK_SIZE).contains(&size) {
                            self.block_size = size;
                        }
                    }
                }
                OPTION_BIGFILE => {
                    if value == "1" {
                        self.bigfile = true;
                    }
                }
                _ => {}
            }
        }
    }
}

/// Decide which requested options the server accepts.
///
/// Returns the agreed values plus the accepted (name, value) pairs for
/// the OACK, preserving request order. Out-of-range values and unknown
/// option names are ignored rather than rejected.
pub fn negotiate(
    requested: &[(String, String)],
    max_block_size: usize,
) -> (NegotiatedOptions, Vec<(String, String)>) {
    let mut agreed = NegotiatedOptions::default();
    let mut accepted = Vec::new();

    for (name, value) in requested {
        match name.to_lowercase().as_str() {
            OPTION_BLKSIZE => {
                if let Ok(size) = value.parse::<usize>() {
                    if size >= 8 && size <= max_block_size.min(MAX_BLOCK_SIZE) {
                        agreed.block_size = size;
                        accepted.push((OPTION_BLKSIZE.to_string(), size.to_string()));
                    }
                }
            }
            OPTION_BIGFILE => {
                if value == "1" {
                    agreed.bigfile = true;
                    accepted.push((OPTION_BIGFILE.to_string(), "1".to_string()));
                }
            }
            _ => {
                debug!("ignoring unknown option: {}", name);
            }
        }
    }

    (agreed, accepted)
}

/// Option pairs a client appends to its RRQ/WRQ.
pub fn request_options(block_size: usize, bigfile: bool) -> Vec<(String, String)> {
    let mut options = Vec::new();
    if block_size != DEFAULT_BLOCK_SIZE {
        options.push((OPTION_BLKSIZE.to_string(), block_size.to_string()));
    }
    if bigfile {
        options.push((OPTION_BIGFILE.to_string(), "1".to_string()));
    }
    options
}
