//! Line-ending transcoding for netascii transfers.
//!
//! Outbound reads expand every LF not already preceded by CR into CR+LF,
//! consuming one fewer source byte per expansion so the fixed block
//! boundary still holds; when the CR lands on the last byte of a block
//! the LF carries into the next one. Inbound writes perform the inverse
//! contraction, including a CR+LF pair that straddles two payloads.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Block-fill reader applied inside the SEND loop.
pub struct NetasciiReader<R> {
    inner: R,
    out: VecDeque<u8>,
    prev: Option<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> NetasciiReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            out: VecDeque::new(),
            prev: None,
            eof: false,
        }
    }

    /// Fill the next DATA payload, at most `block_size` bytes. A payload
    /// shorter than `block_size` means the source is drained.
    pub async fn fill_block(&mut self, block_size: usize) -> std::io::Result<Vec<u8>> {
        let mut scratch = vec![0u8; block_size.max(1)];

        while self.out.len() < block_size && !self.eof {
            let n = self.inner.read(&mut scratch).await?;
            if n == 0 {
                self.eof = true;
                break;
            }
            for &byte in &scratch[..n] {
                if byte == b'\n' && self.prev != Some(b'\r') {
                    self.out.push_back(b'\r');
                }
                self.out.push_back(byte);
                self.prev = Some(byte);
            }
        }

        let take = self.out.len().min(block_size);
        Ok(self.out.drain(..take).collect())
    }
}

/// Contraction writer applied inside the RECEIVE loop.
pub struct NetasciiWriter<W> {
    inner: W,
    pending_cr: bool,
}

impl<W: AsyncWrite + Unpin> NetasciiWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending_cr: false,
        }
    }

    /// Write one DATA payload through the filter. A trailing CR is held
    /// back until the next payload shows whether it starts a CR+LF pair.
    pub async fn write_payload(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let mut out = Vec::with_capacity(payload.len() + 1);

        for &byte in payload {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    out.push(b'\n');
                    continue;
                }
                out.push(b'\r');
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(byte);
            }
        }

        self.inner.write_all(&out).await
    }

    /// Flush a dangling CR after the final block and flush the sink.
    pub async fn finish(&mut self) -> std::io::Result<()> {
        if self.pending_cr {
            self.pending_cr = false;
            self.inner.write_all(b"\r").await?;
        }
        self.inner.flush().await
    }
}
