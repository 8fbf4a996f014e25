//! Client-side engine: initiate a transfer against a server's well-known
//! port and drive the same stop-and-wait state machine the server uses.
//!
//! The server answers from an ephemeral port, so the session starts
//! unpinned and fixes the peer endpoint at the first reply.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, TftpError};
use crate::options::{self, NegotiatedOptions};
use crate::packet::{Packet, Request, TransferMode};
use crate::transfer::{self, BlockSink, BlockSource, RetryPolicy, Session};
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};

pub struct TftpClient {
    server_addr: SocketAddr,
    mode: TransferMode,
    block_size: usize,
    bigfile: bool,
    policy: RetryPolicy,
}

impl TftpClient {
    pub fn new(server_addr: SocketAddr, mode: TransferMode) -> Self {
        Self {
            server_addr,
            mode,
            block_size: DEFAULT_BLOCK_SIZE,
            bigfile: false,
            policy: RetryPolicy {
                timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
                max_retries: DEFAULT_MAX_RETRIES,
            },
        }
    }

    /// Request a non-default block size; takes effect only if the server
    /// accepts it in an OACK.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Request extended 32-bit block counting.
    pub fn with_bigfile(mut self, bigfile: bool) -> Self {
        self.bigfile = bigfile;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Download `remote` into `sink` (RRQ). Returns the payload bytes
    /// written after any netascii contraction.
    pub async fn get<W: AsyncWrite + Unpin>(&self, remote: &str, sink: W) -> Result<u64> {
        let socket = self.bind_socket()?;
        let mut session = Session::unpinned(socket, self.server_addr, self.policy);

        let requested = options::request_options(self.block_size, self.bigfile);
        let oack_expected = !requested.is_empty();
        let request = Packet::Rrq(Request {
            filename: remote.to_string(),
            mode: self.mode,
            options: requested,
        })
        .encode();
        debug!("sending RRQ for {} to {}", remote, self.server_addr);

        // Requested values only bind once the server's OACK accepts
        // them; until then the baseline applies.
        let mut agreed = NegotiatedOptions::default();
        let mut sink = BlockSink::new(self.mode, sink);
        match transfer::receive_blocks(&mut session, &mut sink, &mut agreed, request, oack_expected)
            .await
        {
            Ok(total) => Ok(total),
            Err(e) => {
                transfer::report_failure(&session, &e).await;
                Err(e)
            }
        }
    }

    /// Upload `source` as `remote` (WRQ). Returns the payload bytes sent
    /// after any netascii expansion.
    pub async fn put<R: AsyncRead + Unpin>(&self, source: R, remote: &str) -> Result<u64> {
        let socket = self.bind_socket()?;
        let mut session = Session::unpinned(socket, self.server_addr, self.policy);

        let request = Packet::Wrq(Request {
            filename: remote.to_string(),
            mode: self.mode,
            options: options::request_options(self.block_size, self.bigfile),
        })
        .encode();
        debug!("sending WRQ for {} to {}", remote, self.server_addr);

        let agreed = match self.await_write_go_ahead(&mut session, &request).await {
            Ok(agreed) => agreed,
            Err(e) => {
                transfer::report_failure(&session, &e).await;
                return Err(e);
            }
        };

        let mut source = BlockSource::new(self.mode, source);
        match transfer::send_blocks(&mut session, &mut source, &agreed).await {
            Ok(total) => Ok(total),
            Err(e) => {
                transfer::report_failure(&session, &e).await;
                Err(e)
            }
        }
    }

    /// Send the WRQ and wait for the server's go-ahead: a plain ACK(0)
    /// means every option was declined, an OACK carries the accepted
    /// subset and is answered directly with DATA block 1.
    async fn await_write_go_ahead(
        &self,
        session: &mut Session,
        request: &[u8],
    ) -> Result<NegotiatedOptions> {
        let mut retries = 0u32;
        let max_retries = self.policy.max_retries.max(1);
        session.send(request).await?;
        // One deadline per transmitted request, as in the data phase.
        let mut deadline = Instant::now() + self.policy.timeout;

        loop {
            match session.recv_until(DEFAULT_BLOCK_SIZE, deadline).await {
                Ok(Packet::Ack { block: 0 }) => return Ok(NegotiatedOptions::default()),
                Ok(Packet::Ack { block }) => {
                    debug!(block, "ignoring stale ACK before data phase");
                }
                Ok(Packet::Oack { options: accepted }) => {
                    let mut agreed = NegotiatedOptions::default();
                    agreed.apply_oack(&accepted);
                    debug!(?accepted, "options accepted by server");
                    return Ok(agreed);
                }
                Ok(Packet::Error { code, message }) => {
                    return Err(TftpError::Peer { code, message });
                }
                Ok(other) => {
                    debug!("unexpected {:?} while waiting for WRQ ACK", other.opcode());
                }
                Err(TftpError::Timeout) => {
                    retries += 1;
                    if retries >= max_retries {
                        return Err(TftpError::RetryExhausted { block: 0 });
                    }
                    debug!(retries, "timeout waiting for WRQ ACK, resending request");
                    session.send(request).await?;
                    deadline = Instant::now() + self.policy.timeout;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ephemeral local socket with a receive buffer sized for the
    /// requested block size, in the server's address family.
    fn bind_socket(&self) -> Result<UdpSocket> {
        let domain = Domain::for_address(self.server_addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(((self.block_size + 4) * 4).max(64 * 1024))?;
        socket.set_nonblocking(true)?;

        let unspecified: SocketAddr = if self.server_addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&unspecified.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}
