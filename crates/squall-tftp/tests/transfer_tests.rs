//! End-to-end exercises over loopback UDP: a real server task, real
//! files under a temp root, and either the library client or a raw
//! socket when the test needs to see individual wire packets.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use squall_tftp::config::TftpConfig;
use squall_tftp::transfer::RetryPolicy;
use squall_tftp::{
    ErrorCode, Packet, Request, TftpClient, TftpServer, TransferMode,
};

fn temp_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("squall_e2e_{}_{}", name, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(root_dir: PathBuf) -> TftpConfig {
    TftpConfig {
        root_dir,
        timeout_secs: 2,
        ..Default::default()
    }
}

async fn start_server(mut config: TftpConfig) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    config.bind_addr = addr;
    let server = TftpServer::new(config);
    tokio::spawn(async move {
        let _ = server.run_on(socket).await;
    });
    addr
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_millis(500),
        max_retries: 4,
    }
}

async fn raw_client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = vec![0u8; 65536];
    let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for packet")
        .unwrap();
    (Packet::decode(&buf[..len]).unwrap(), from)
}

async fn expect_silence(socket: &UdpSocket, window: Duration) {
    let mut buf = vec![0u8; 65536];
    let outcome = timeout(window, socket.recv_from(&mut buf)).await;
    assert!(outcome.is_err(), "expected no further packets");
}

fn rrq(filename: &str, mode: TransferMode, options: Vec<(String, String)>) -> Vec<u8> {
    Packet::Rrq(Request {
        filename: filename.to_string(),
        mode,
        options,
    })
    .encode()
}

fn wrq(filename: &str, mode: TransferMode, options: Vec<(String, String)>) -> Vec<u8> {
    Packet::Wrq(Request {
        filename: filename.to_string(),
        mode,
        options,
    })
    .encode()
}

#[tokio::test]
async fn rrq_1300_bytes_yields_blocks_512_512_276() {
    let root = temp_root("rrq1300");
    let payload: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.join("data.bin"), &payload).unwrap();
    let server = start_server(test_config(root)).await;

    let socket = raw_client().await;
    socket
        .send_to(&rrq("data.bin", TransferMode::Octet, vec![]), server)
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut observed = Vec::new();
    loop {
        let (packet, from) = recv_packet(&socket).await;
        match packet {
            Packet::Data { block, payload } => {
                observed.push((block, payload.len()));
                received.extend_from_slice(&payload);
                let done = payload.len() < 512;
                socket
                    .send_to(&Packet::Ack { block }.encode(), from)
                    .await
                    .unwrap();
                if done {
                    break;
                }
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    assert_eq!(observed, vec![(1, 512), (2, 512), (3, 276)]);
    assert_eq!(received, payload);
}

#[tokio::test]
async fn exact_multiple_file_ends_with_empty_block() {
    let root = temp_root("exact");
    std::fs::write(root.join("even.bin"), vec![0xabu8; 1024]).unwrap();
    let server = start_server(test_config(root)).await;

    let socket = raw_client().await;
    socket
        .send_to(&rrq("even.bin", TransferMode::Octet, vec![]), server)
        .await
        .unwrap();

    let mut sizes = Vec::new();
    loop {
        let (packet, from) = recv_packet(&socket).await;
        match packet {
            Packet::Data { block, payload } => {
                sizes.push(payload.len());
                let done = payload.len() < 512;
                socket
                    .send_to(&Packet::Ack { block }.encode(), from)
                    .await
                    .unwrap();
                if done {
                    break;
                }
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    assert_eq!(sizes, vec![512, 512, 0]);
}

#[tokio::test]
async fn missing_file_yields_single_error_code_1() {
    let root = temp_root("missing");
    let server = start_server(test_config(root)).await;

    let socket = raw_client().await;
    socket
        .send_to(&rrq("no-such-file", TransferMode::Octet, vec![]), server)
        .await
        .unwrap();

    let (packet, _) = recv_packet(&socket).await;
    match packet {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
        other => panic!("unexpected packet: {:?}", other),
    }
    expect_silence(&socket, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn wrq_with_writes_disabled_yields_single_error_code_2() {
    let root = temp_root("nowrite");
    let mut config = test_config(root);
    config.allow_writes = false;
    let server = start_server(config).await;

    let socket = raw_client().await;
    socket
        .send_to(&wrq("upload.bin", TransferMode::Octet, vec![]), server)
        .await
        .unwrap();

    let (packet, _) = recv_packet(&socket).await;
    match packet {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::AccessViolation),
        other => panic!("unexpected packet: {:?}", other),
    }
    expect_silence(&socket, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn netascii_rrq_expands_lf_on_the_wire() {
    let root = temp_root("netascii");
    std::fs::write(root.join("text.txt"), b"A\nB").unwrap();
    let server = start_server(test_config(root)).await;

    let socket = raw_client().await;
    socket
        .send_to(&rrq("text.txt", TransferMode::Netascii, vec![]), server)
        .await
        .unwrap();

    let (packet, from) = recv_packet(&socket).await;
    match packet {
        Packet::Data { block, payload } => {
            assert_eq!(block, 1);
            assert_eq!(payload, b"A\r\nB".to_vec());
            socket
                .send_to(&Packet::Ack { block }.encode(), from)
                .await
                .unwrap();
        }
        other => panic!("unexpected packet: {:?}", other),
    }
}

#[tokio::test]
async fn blksize_option_is_negotiated_with_oack() {
    let root = temp_root("blksize");
    std::fs::write(root.join("big.bin"), vec![7u8; 1500]).unwrap();
    let server = start_server(test_config(root)).await;

    let socket = raw_client().await;
    let options = vec![("blksize".to_string(), "1024".to_string())];
    socket
        .send_to(&rrq("big.bin", TransferMode::Octet, options.clone()), server)
        .await
        .unwrap();

    let (packet, from) = recv_packet(&socket).await;
    match packet {
        Packet::Oack { options: accepted } => assert_eq!(accepted, options),
        other => panic!("expected OACK, got {:?}", other),
    }
    socket
        .send_to(&Packet::Ack { block: 0 }.encode(), from)
        .await
        .unwrap();

    let mut sizes = Vec::new();
    loop {
        let (packet, from) = recv_packet(&socket).await;
        match packet {
            Packet::Data { block, payload } => {
                sizes.push(payload.len());
                let done = payload.len() < 1024;
                socket
                    .send_to(&Packet::Ack { block }.encode(), from)
                    .await
                    .unwrap();
                if done {
                    break;
                }
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }
    assert_eq!(sizes, vec![1024, 476]);
}

#[tokio::test]
async fn bigfile_option_is_echoed_in_oack() {
    let root = temp_root("bigfile");
    std::fs::write(root.join("f.bin"), b"tiny").unwrap();
    let server = start_server(test_config(root)).await;

    let socket = raw_client().await;
    let options = vec![("bigfile".to_string(), "1".to_string())];
    socket
        .send_to(&rrq("f.bin", TransferMode::Octet, options.clone()), server)
        .await
        .unwrap();

    let (packet, from) = recv_packet(&socket).await;
    match packet {
        Packet::Oack { options: accepted } => assert_eq!(accepted, options),
        other => panic!("expected OACK, got {:?}", other),
    }
    socket
        .send_to(&Packet::Ack { block: 0 }.encode(), from)
        .await
        .unwrap();

    let (packet, from) = recv_packet(&socket).await;
    match packet {
        Packet::Data { block: 1, payload } => {
            assert_eq!(payload, b"tiny".to_vec());
            socket
                .send_to(&Packet::Ack { block: 1 }.encode(), from)
                .await
                .unwrap();
        }
        other => panic!("unexpected packet: {:?}", other),
    }
}

#[tokio::test]
async fn client_download_matches_file() {
    let root = temp_root("client_get");
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 255) as u8).collect();
    std::fs::write(root.join("blob.bin"), &payload).unwrap();
    let server = start_server(test_config(root)).await;

    let client = TftpClient::new(server, TransferMode::Octet).with_policy(fast_policy());
    let mut sink = Vec::new();
    let bytes = client.get("blob.bin", &mut sink).await.unwrap();

    assert_eq!(bytes, payload.len() as u64);
    assert_eq!(sink, payload);
}

#[tokio::test]
async fn client_download_with_negotiated_block_size() {
    let root = temp_root("client_blksize");
    let payload = vec![0x5au8; 5000];
    std::fs::write(root.join("blob.bin"), &payload).unwrap();
    let server = start_server(test_config(root)).await;

    let client = TftpClient::new(server, TransferMode::Octet)
        .with_block_size(2048)
        .with_policy(fast_policy());
    let mut sink = Vec::new();
    let bytes = client.get("blob.bin", &mut sink).await.unwrap();

    assert_eq!(bytes, 5000);
    assert_eq!(sink, payload);
}

#[tokio::test]
async fn client_upload_round_trips() {
    let root = temp_root("client_put");
    let server = start_server(test_config(root.clone())).await;

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
    let client = TftpClient::new(server, TransferMode::Octet).with_policy(fast_policy());
    let bytes = client.put(payload.as_slice(), "upload.bin").await.unwrap();

    assert_eq!(bytes, payload.len() as u64);
    // The short final ACK may still be in flight when put() returns the
    // buffered file, so give the server a moment to close out.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(std::fs::read(root.join("upload.bin")).unwrap(), payload);
}

#[tokio::test]
async fn netascii_upload_contracts_line_endings_on_disk() {
    let root = temp_root("netascii_put");
    let server = start_server(test_config(root.clone())).await;

    let client = TftpClient::new(server, TransferMode::Netascii).with_policy(fast_policy());
    client.put(&b"one\ntwo\n"[..], "notes.txt").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(std::fs::read(root.join("notes.txt")).unwrap(), b"one\ntwo\n");
}

#[tokio::test]
async fn lock_capacity_exhaustion_is_reported_to_peer() {
    let root = temp_root("lockcap");
    std::fs::write(root.join("a.bin"), b"aaaa").unwrap();
    std::fs::write(root.join("b.bin"), b"bbbb").unwrap();
    let mut config = test_config(root);
    config.lock_capacity = 1;
    let server = start_server(config).await;

    // First name claims the only registry slot and keeps it forever.
    let client = TftpClient::new(server, TransferMode::Octet).with_policy(fast_policy());
    let mut sink = Vec::new();
    client.get("a.bin", &mut sink).await.unwrap();

    let socket = raw_client().await;
    socket
        .send_to(&rrq("b.bin", TransferMode::Octet, vec![]), server)
        .await
        .unwrap();
    let (packet, _) = recv_packet(&socket).await;
    match packet {
        Packet::Error { code, message } => {
            assert_eq!(code, ErrorCode::NotDefined);
            assert!(message.contains("lock table full"));
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_sessions_on_same_file_are_serialized() {
    let root = temp_root("serial");
    std::fs::write(root.join("shared.bin"), b"stale").unwrap();
    let server = start_server(test_config(root)).await;

    // Writer claims the file lock and then stalls before sending data.
    let writer = raw_client().await;
    writer
        .send_to(&wrq("shared.bin", TransferMode::Octet, vec![]), server)
        .await
        .unwrap();
    let (packet, writer_peer) = recv_packet(&writer).await;
    assert_eq!(packet, Packet::Ack { block: 0 });

    // A reader of the same file must not get any DATA while the writer
    // holds the lock.
    let reader = raw_client().await;
    reader
        .send_to(&rrq("shared.bin", TransferMode::Octet, vec![]), server)
        .await
        .unwrap();
    expect_silence(&reader, Duration::from_millis(300)).await;

    // Writer finishes with one short block; the lock is released.
    writer
        .send_to(
            &Packet::Data {
                block: 1,
                payload: b"fresh".to_vec(),
            }
            .encode(),
            writer_peer,
        )
        .await
        .unwrap();
    let (packet, _) = recv_packet(&writer).await;
    assert_eq!(packet, Packet::Ack { block: 1 });

    // Now the reader's session proceeds and sees the writer's bytes.
    let (packet, reader_peer) = recv_packet(&reader).await;
    match packet {
        Packet::Data { block, payload } => {
            assert_eq!(block, 1);
            assert_eq!(payload, b"fresh".to_vec());
            reader
                .send_to(&Packet::Ack { block }.encode(), reader_peer)
                .await
                .unwrap();
        }
        other => panic!("unexpected packet: {:?}", other),
    }
}

#[tokio::test]
async fn unknown_opcode_on_listening_socket_gets_error_reply() {
    let root = temp_root("badop");
    let server = start_server(test_config(root)).await;

    let socket = raw_client().await;
    socket
        .send_to(&Packet::Ack { block: 3 }.encode(), server)
        .await
        .unwrap();

    let (packet, _) = recv_packet(&socket).await;
    match packet {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::IllegalOperation),
        other => panic!("expected ERROR, got {:?}", other),
    }
}

#[tokio::test]
async fn malformed_datagram_is_dropped_without_reply() {
    let root = temp_root("malformed");
    let server = start_server(test_config(root)).await;

    let socket = raw_client().await;
    socket.send_to(&[0u8, 1, b'x'], server).await.unwrap();
    expect_silence(&socket, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn traversal_filename_is_rejected() {
    let root = temp_root("traversal");
    let server = start_server(test_config(root)).await;

    let socket = raw_client().await;
    socket
        .send_to(
            &rrq("../../etc/passwd", TransferMode::Octet, vec![]),
            server,
        )
        .await
        .unwrap();

    let (packet, _) = recv_packet(&socket).await;
    match packet {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::AccessViolation),
        other => panic!("expected ERROR, got {:?}", other),
    }
}
