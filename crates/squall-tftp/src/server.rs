//! The request dispatcher: one receive loop on the well-known socket,
//! one isolated session per inbound request.
//!
//! Each transfer gets its own ephemeral socket and its own task, so
//! session traffic never crosses the shared listening socket and a slow
//! peer cannot stall the loop. The only state sessions share is the file
//! lock registry.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::TftpConfig;
use crate::error::{Result, TftpError};
use crate::locks::LockRegistry;
use crate::options;
use crate::packet::{ErrorCode, Packet, Request};
use crate::transfer::{self, BlockSink, BlockSource, RetryPolicy, Session};
use crate::MAX_PACKET_SIZE;

pub struct TftpServer {
    config: Arc<TftpConfig>,
    locks: Arc<LockRegistry>,
}

impl TftpServer {
    pub fn new(config: TftpConfig) -> Self {
        let locks = Arc::new(LockRegistry::new(config.lock_capacity));
        Self {
            config: Arc::new(config),
            locks,
        }
    }

    /// Run the main receive loop. Returns only if the well-known socket
    /// cannot be bound; per-datagram failures are logged and the loop
    /// keeps serving.
    pub async fn run(&self) -> Result<()> {
        let socket = UdpSocket::bind(self.config.bind_addr).await?;
        self.run_on(socket).await
    }

    /// Same as [`run`](Self::run) on an already-bound socket. Lets tests
    /// bind to an ephemeral port first.
    pub async fn run_on(&self, socket: UdpSocket) -> Result<()> {
        let local = socket.local_addr()?;
        info!("TFTP server listening on {}", local);

        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, client_addr)) => {
                    let data = buf[..size].to_vec();
                    let config = Arc::clone(&self.config);
                    let locks = Arc::clone(&self.locks);

                    tokio::spawn(async move {
                        if let Err(e) = handle_request(data, client_addr, config, locks).await {
                            error!("error handling client {}: {}", client_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("error receiving on listening socket: {}", e);
                }
            }
        }
    }
}

async fn handle_request(
    data: Vec<u8>,
    client_addr: SocketAddr,
    config: Arc<TftpConfig>,
    locks: Arc<LockRegistry>,
) -> Result<()> {
    // A datagram that does not decode is dropped without a reply.
    let packet = match Packet::decode(&data) {
        Ok(packet) => packet,
        Err(e) => {
            debug!("dropping undecodable datagram from {}: {}", client_addr, e);
            return Ok(());
        }
    };

    match packet {
        Packet::Rrq(request) => {
            debug!(
                "RRQ from {}: {} (mode: {}, options: {:?})",
                client_addr,
                request.filename,
                request.mode.as_str(),
                request.options
            );
            serve_transfer(request, client_addr, config, locks, Direction::Send).await
        }
        Packet::Wrq(request) => {
            debug!(
                "WRQ from {}: {} (mode: {}, options: {:?})",
                client_addr,
                request.filename,
                request.mode.as_str(),
                request.options
            );
            serve_transfer(request, client_addr, config, locks, Direction::Receive).await
        }
        other => {
            warn!(
                "unexpected {:?} on listening socket from {}",
                other.opcode(),
                client_addr
            );
            let session = bind_session(&config, client_addr).await?;
            session
                .send_error(ErrorCode::IllegalOperation, "not a transfer request")
                .await;
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Receive,
}

/// Drive one transfer to a terminal state. The peer always sees either a
/// completed exchange or a single ERROR packet; only retry exhaustion
/// after our own ERROR went unanswered ends a session silently.
async fn serve_transfer(
    request: Request,
    client_addr: SocketAddr,
    config: Arc<TftpConfig>,
    locks: Arc<LockRegistry>,
    direction: Direction,
) -> Result<()> {
    let mut session = bind_session(&config, client_addr).await?;

    if direction == Direction::Receive && !config.allow_writes {
        warn!("WRQ from {} rejected: writes disabled", client_addr);
        session
            .send_error(ErrorCode::AccessViolation, "writes are disabled")
            .await;
        return Ok(());
    }

    let path = match resolve_path(&config.root_dir, &request.filename) {
        Ok(path) => path,
        Err(e) => {
            session.send_error(ErrorCode::AccessViolation, &e.to_string()).await;
            return Ok(());
        }
    };

    // Serialize against every other transfer touching this filename,
    // held until the session reaches a terminal state.
    let _lock = match locks.acquire(&request.filename).await {
        Ok(handle) => handle,
        Err(e) => {
            session.send_error(ErrorCode::NotDefined, &e.to_string()).await;
            return Err(e);
        }
    };

    let (agreed, accepted) = options::negotiate(&request.options, config.max_block_size);

    let outcome = match direction {
        Direction::Send => {
            let file = match File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    let (code, message) = map_open_error(&e);
                    session.send_error(code, message).await;
                    return Ok(());
                }
            };

            let handshake = if accepted.is_empty() {
                Ok(())
            } else {
                transfer::send_oack(&mut session, accepted, agreed.block_size).await
            };

            match handshake {
                Ok(()) => {
                    let mut source = BlockSource::new(request.mode, file);
                    transfer::send_blocks(&mut session, &mut source, &agreed).await
                }
                Err(e) => Err(e),
            }
        }
        Direction::Receive => {
            let file = match File::create(&path).await {
                Ok(file) => file,
                Err(e) => {
                    let (code, message) = map_open_error(&e);
                    session.send_error(code, message).await;
                    return Ok(());
                }
            };

            let initial_reply = if accepted.is_empty() {
                Packet::Ack { block: 0 }.encode()
            } else {
                Packet::Oack { options: accepted }.encode()
            };

            let mut sink = BlockSink::new(request.mode, file);
            let mut agreed = agreed;
            transfer::receive_blocks(&mut session, &mut sink, &mut agreed, initial_reply, false)
                .await
        }
    };

    match outcome {
        Ok(bytes) => {
            info!(
                "transfer complete: {} {:?} ({} bytes, peer {})",
                request.filename, direction, bytes, client_addr
            );
            Ok(())
        }
        Err(e) => {
            transfer::report_failure(&session, &e).await;
            Err(e)
        }
    }
}

/// Bind the per-session socket on an ephemeral port, in the same address
/// family as the listening socket.
async fn bind_session(config: &TftpConfig, client_addr: SocketAddr) -> Result<Session> {
    let local = SocketAddr::new(config.bind_addr.ip(), 0);
    let socket = UdpSocket::bind(local).await?;
    let policy = RetryPolicy {
        timeout: Duration::from_secs(config.timeout_secs),
        max_retries: config.max_retries,
    };
    Ok(Session::pinned(socket, client_addr, policy))
}

fn map_open_error(error: &std::io::Error) -> (ErrorCode, &'static str) {
    match error.kind() {
        std::io::ErrorKind::NotFound => (ErrorCode::FileNotFound, "file not found"),
        std::io::ErrorKind::PermissionDenied => (ErrorCode::AccessViolation, "access denied"),
        _ => (ErrorCode::NotDefined, "failed to open file"),
    }
}

/// Resolve a requested filename under the root directory, rejecting
/// anything that could escape it.
fn resolve_path(root_dir: &Path, filename: &str) -> Result<PathBuf> {
    let filename = filename.replace('\\', "/");
    if filename.contains("..") {
        return Err(TftpError::ProtocolViolation("invalid filename".to_string()));
    }

    let file_path = root_dir.join(filename.trim_start_matches('/'));

    let canonical_root = root_dir
        .canonicalize()
        .map_err(|_| TftpError::ProtocolViolation("root directory error".to_string()))?;

    // Boundary check against the nearest existing ancestor, so a path to
    // a not-yet-created file is still validated.
    if let Ok(canonical_file) = file_path.canonicalize() {
        if !canonical_file.starts_with(&canonical_root) {
            return Err(TftpError::ProtocolViolation("access denied".to_string()));
        }
    } else if let Some(parent) = file_path.parent() {
        if let Ok(canonical_parent) = parent.canonicalize() {
            if !canonical_parent.starts_with(&canonical_root) {
                return Err(TftpError::ProtocolViolation("access denied".to_string()));
            }
        }
    }

    Ok(file_path)
}
