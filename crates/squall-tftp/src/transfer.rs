//! The per-transfer stop-and-wait state machine.
//!
//! One `Session` per transfer, owned by one task for its whole lifetime.
//! The SEND direction reads blocks from a `BlockSource` and waits for the
//! matching ACK before advancing; the RECEIVE direction acknowledges an
//! initial control packet and then writes in-order DATA blocks through a
//! `BlockSink`. Every retransmission resends the retained bytes verbatim.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::netascii::{NetasciiReader, NetasciiWriter};
use crate::options::NegotiatedOptions;
use crate::packet::{ErrorCode, Packet, TransferMode, MIN_PACKET_SIZE};

/// Timeout and retry budget shared by both directions. `max_retries`
/// counts transmission attempts per block, the initial send included.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

/// One UDP conversation with a single peer.
///
/// Server sessions know their peer from the request datagram; client
/// sessions start unpinned and fix the peer endpoint at the first reply,
/// after which datagrams from any other address are ignored.
pub struct Session {
    socket: UdpSocket,
    target: SocketAddr,
    peer: Option<SocketAddr>,
    policy: RetryPolicy,
}

impl Session {
    /// Session whose peer endpoint is already known (server side).
    pub fn pinned(socket: UdpSocket, peer: SocketAddr, policy: RetryPolicy) -> Self {
        Self {
            socket,
            target: peer,
            peer: Some(peer),
            policy,
        }
    }

    /// Session that sends to the well-known port until the peer's
    /// transfer endpoint is observed (client side).
    pub fn unpinned(socket: UdpSocket, target: SocketAddr, policy: RetryPolicy) -> Self {
        Self {
            socket,
            target,
            peer: None,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let dest = self.peer.unwrap_or(self.target);
        self.socket.send_to(data, dest).await?;
        Ok(())
    }

    /// Best-effort ERROR to the peer; failures are logged, not returned.
    pub async fn send_error(&self, code: ErrorCode, message: &str) {
        let packet = Packet::Error {
            code,
            message: message.to_string(),
        }
        .encode();
        if let Err(e) = self.send(&packet).await {
            debug!("failed to send ERROR packet: {}", e);
        }
    }

    /// Wait for the next well-formed datagram from the pinned peer, up to
    /// one timeout window. Datagrams from other addresses, datagrams that
    /// fail to decode (including anything shorter than 4 bytes) and
    /// oversized datagrams are discarded and the wait continues, so they
    /// count against the same timeout/retry accounting as silence.
    pub async fn recv(&mut self, max_payload: usize) -> Result<Packet> {
        let deadline = Instant::now() + self.policy.timeout;
        self.recv_until(max_payload, deadline).await
    }

    /// Like [`recv`](Self::recv) against a caller-supplied deadline, so a
    /// run of ignorable packets cannot keep re-arming the wait window.
    pub async fn recv_until(&mut self, max_payload: usize, deadline: Instant) -> Result<Packet> {
        let mut buf = vec![0u8; max_payload + MIN_PACKET_SIZE + 1];

        loop {
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => return Err(TftpError::Io(e)),
                Err(_) => return Err(TftpError::Timeout),
            };

            match self.peer {
                Some(peer) if from != peer => {
                    warn!("ignoring datagram from unexpected source {}", from);
                    continue;
                }
                Some(_) => {}
                None => {
                    self.peer = Some(from);
                    debug!("peer endpoint pinned to {}", from);
                }
            }

            if len == buf.len() {
                debug!("discarding oversized datagram ({} bytes)", len);
                continue;
            }

            match Packet::decode(&buf[..len]) {
                Ok(packet) => return Ok(packet),
                Err(e) => {
                    debug!("discarding undecodable datagram: {}", e);
                    continue;
                }
            }
        }
    }
}

/// Block numbers are 16-bit on the wire. The internal counter is wider;
/// without the bigfile option a transfer that would pass block 65535
/// aborts instead of wrapping, with bigfile the wire field wraps from
/// 65535 to 0 and counting continues.
struct BlockCounter {
    current: u32,
    bigfile: bool,
}

impl BlockCounter {
    fn new(start: u32, bigfile: bool) -> Self {
        Self {
            current: start,
            bigfile,
        }
    }

    fn wire(&self) -> u16 {
        (self.current & 0xffff) as u16
    }

    fn set_bigfile(&mut self, bigfile: bool) {
        self.bigfile = bigfile;
    }

    fn advance(&mut self) -> Result<()> {
        if !self.bigfile && self.current >= u16::MAX as u32 {
            return Err(TftpError::ProtocolViolation(
                "block number limit reached without the bigfile option".to_string(),
            ));
        }
        self.current = self.current.wrapping_add(1);
        Ok(())
    }
}

/// The read side of the file abstraction, with the transcoding filter
/// applied inside the block-fill step for netascii transfers.
pub enum BlockSource<R> {
    Octet(R),
    Netascii(NetasciiReader<R>),
}

impl<R: AsyncRead + Unpin> BlockSource<R> {
    pub fn new(mode: TransferMode, inner: R) -> Self {
        match mode {
            TransferMode::Octet => BlockSource::Octet(inner),
            TransferMode::Netascii => BlockSource::Netascii(NetasciiReader::new(inner)),
        }
    }

    async fn fill_block(&mut self, block_size: usize) -> std::io::Result<Vec<u8>> {
        match self {
            BlockSource::Octet(inner) => {
                let mut buf = vec![0u8; block_size];
                let mut filled = 0;
                while filled < block_size {
                    let n = inner.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            BlockSource::Netascii(reader) => reader.fill_block(block_size).await,
        }
    }
}

/// The write side of the file abstraction, with the inverse contraction
/// for netascii transfers.
pub enum BlockSink<W> {
    Octet(W),
    Netascii(NetasciiWriter<W>),
}

impl<W: AsyncWrite + Unpin> BlockSink<W> {
    pub fn new(mode: TransferMode, inner: W) -> Self {
        match mode {
            TransferMode::Octet => BlockSink::Octet(inner),
            TransferMode::Netascii => BlockSink::Netascii(NetasciiWriter::new(inner)),
        }
    }

    async fn write_payload(&mut self, payload: &[u8]) -> std::io::Result<()> {
        match self {
            BlockSink::Octet(inner) => inner.write_all(payload).await,
            BlockSink::Netascii(writer) => writer.write_payload(payload).await,
        }
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        match self {
            BlockSink::Octet(inner) => inner.flush().await,
            BlockSink::Netascii(writer) => writer.finish().await,
        }
    }
}

/// SEND direction: stream the source as numbered DATA blocks, one in
/// flight at a time, starting at block 1. A payload shorter than the
/// block size marks the final block; an exact-multiple source ends with
/// an explicit empty block. Returns the payload bytes sent.
pub async fn send_blocks<R: AsyncRead + Unpin>(
    session: &mut Session,
    source: &mut BlockSource<R>,
    options: &NegotiatedOptions,
) -> Result<u64> {
    let mut counter = BlockCounter::new(1, options.bigfile);
    let mut total = 0u64;

    loop {
        let payload = source.fill_block(options.block_size).await?;
        let last = payload.len() < options.block_size;
        total += payload.len() as u64;

        // Retained so every retransmission is byte-identical.
        let wire_block = counter.wire();
        let data_packet = Packet::Data {
            block: wire_block,
            payload,
        }
        .encode();

        await_ack(session, &data_packet, wire_block, options.block_size).await?;
        debug!(block = wire_block, "block acknowledged");

        if last {
            return Ok(total);
        }
        counter.advance()?;
    }
}

/// Transmit one packet and wait for its ACK, retransmitting the identical
/// bytes on every timeout until the retry budget runs out. Stale ACKs and
/// unexpected packet kinds are ignored within the current window; a peer
/// ERROR is terminal.
async fn await_ack(
    session: &mut Session,
    packet: &[u8],
    expected_block: u16,
    max_payload: usize,
) -> Result<()> {
    let max_retries = session.policy().max_retries.max(1);

    for attempt in 0..max_retries {
        if attempt > 0 {
            debug!(
                block = expected_block,
                attempt, "retransmitting after timeout"
            );
        }
        session.send(packet).await?;
        // One deadline per transmission attempt: stale or unexpected
        // packets are ignored without restarting the window, so a peer
        // that only ever sends them still burns through the budget.
        let deadline = Instant::now() + session.policy().timeout;

        loop {
            match session.recv_until(max_payload, deadline).await {
                Ok(Packet::Ack { block }) if block == expected_block => return Ok(()),
                Ok(Packet::Ack { block }) => {
                    debug!(block, expected_block, "ignoring stale ACK");
                }
                Ok(Packet::Error { code, message }) => {
                    return Err(TftpError::Peer { code, message });
                }
                Ok(other) => {
                    warn!(
                        "unexpected {:?} while waiting for ACK {}",
                        other.opcode(),
                        expected_block
                    );
                }
                Err(TftpError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
    }

    Err(TftpError::RetryExhausted {
        block: expected_block,
    })
}

/// Send an OACK in place of the first ACK/DATA and wait for the peer's
/// empty ACK(0) before the data phase starts. Same retransmission
/// contract as a DATA block.
pub async fn send_oack(
    session: &mut Session,
    accepted: Vec<(String, String)>,
    max_payload: usize,
) -> Result<()> {
    let packet = Packet::Oack { options: accepted }.encode();
    await_ack(session, &packet, 0, max_payload).await
}

/// Send the one terminal ERROR a failed session owes its peer. Peer
/// errors and per-window timeouts never produce one.
pub async fn report_failure(session: &Session, error: &TftpError) {
    match error {
        TftpError::RetryExhausted { .. } => {
            session
                .send_error(ErrorCode::NotDefined, "retry budget exhausted")
                .await;
        }
        TftpError::ProtocolViolation(message) => {
            session.send_error(ErrorCode::IllegalOperation, message).await;
        }
        TftpError::Io(e) => {
            session
                .send_error(ErrorCode::DiskFull, &format!("file IO failed: {}", e))
                .await;
        }
        _ => {}
    }
}

/// RECEIVE direction: acknowledge the initiating packet, then accept
/// in-order DATA blocks until a short one arrives. `initial_reply` is the
/// retained control packet this end keeps retransmitting on timeout — the
/// ACK(0)/OACK on the server side, the original request on the client
/// side. With `oack_expected` the first reply may be an OACK, which is
/// acknowledged with ACK(0) and applied to `options`; a first DATA or a
/// plain ACK instead means the peer declined every option and `options`
/// falls back to the baseline. Returns the payload bytes written.
pub async fn receive_blocks<W: AsyncWrite + Unpin>(
    session: &mut Session,
    sink: &mut BlockSink<W>,
    options: &mut NegotiatedOptions,
    initial_reply: Vec<u8>,
    oack_expected: bool,
) -> Result<u64> {
    let mut last_reply = initial_reply;
    session.send(&last_reply).await?;

    let mut counter = BlockCounter::new(1, options.bigfile);
    let mut oack_allowed = oack_expected;
    let mut retries = 0u32;
    let mut total = 0u64;
    let max_retries = session.policy().max_retries.max(1);

    loop {
        // Requested options are only in force once the peer accepts them,
        // so before that the peer may legitimately use the default size.
        let window = options.block_size.max(crate::DEFAULT_BLOCK_SIZE);

        match session.recv(window).await {
            Ok(Packet::Data { block, payload }) => {
                if oack_allowed {
                    // First DATA instead of an OACK: every option declined.
                    oack_allowed = false;
                    *options = NegotiatedOptions::default();
                    counter.set_bigfile(false);
                }
                if payload.len() > options.block_size {
                    warn!(
                        block,
                        size = payload.len(),
                        "DATA exceeds negotiated block size, ignoring"
                    );
                    continue;
                }
                if block != counter.wire() {
                    debug!(
                        block,
                        expected = counter.wire(),
                        "ignoring out-of-sequence DATA"
                    );
                    continue;
                }

                sink.write_payload(&payload).await?;
                total += payload.len() as u64;

                let reply = Packet::Ack { block }.encode();
                session.send(&reply).await?;
                last_reply = reply;
                retries = 0;

                if payload.len() < options.block_size {
                    sink.finish().await?;
                    return Ok(total);
                }
                counter.advance()?;
            }
            Ok(Packet::Oack { options: accepted }) if oack_allowed => {
                oack_allowed = false;
                options.apply_oack(&accepted);
                counter.set_bigfile(options.bigfile);
                debug!(?accepted, "options accepted by peer");

                let reply = Packet::Ack { block: 0 }.encode();
                session.send(&reply).await?;
                last_reply = reply;
                retries = 0;
            }
            Ok(Packet::Ack { block }) => {
                // Duplicate of the peer's handshake ACK, harmless.
                debug!(block, "ignoring ACK in receive direction");
                if oack_allowed {
                    oack_allowed = false;
                    *options = NegotiatedOptions::default();
                    counter.set_bigfile(false);
                }
            }
            Ok(Packet::Error { code, message }) => {
                return Err(TftpError::Peer { code, message });
            }
            Ok(other) => {
                warn!("unexpected {:?} in receive direction", other.opcode());
            }
            Err(TftpError::Timeout) => {
                retries += 1;
                if retries >= max_retries {
                    return Err(TftpError::RetryExhausted {
                        block: counter.wire(),
                    });
                }
                debug!(
                    expected = counter.wire(),
                    retries, "timeout, retransmitting last control packet"
                );
                session.send(&last_reply).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
