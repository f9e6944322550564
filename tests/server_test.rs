use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use lanshare::config::ServerConfig;
use lanshare::discovery::parse_discovery_reply;
use lanshare::server::{ChatServer, build_context};
use lanshare::{FileKind, ServerMessage, Status};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    tcp: SocketAddr,
    udp: SocketAddr,
    files_dir: PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        tcp_port: 0,
        udp_port: 0,
        files_dir: dir.path().join("files"),
        users_file: dir.path().join("users.json"),
        log_file: dir.path().join("server.log"),
        max_frame_bytes: 64 * 1024,
        ..ServerConfig::default()
    };

    let ctx = build_context(&config).await.unwrap();
    let server = ChatServer::bind(&config, ctx).await.unwrap();
    let tcp = server.local_addr().unwrap();
    let udp = server.discovery_addr().expect("discovery socket");
    tokio::spawn(server.run());

    TestServer {
        tcp,
        udp,
        files_dir: config.files_dir.clone(),
        _dir: dir,
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, value: serde_json::Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Next message, or `None` once the server closed (or reset) the connection
    async fn recv(&mut self) -> Option<ServerMessage> {
        let mut line = String::new();
        let read = tokio::time::timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for the server");
        match read {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(serde_json::from_str(line.trim_end()).unwrap()),
        }
    }

    async fn expect(&mut self) -> ServerMessage {
        self.recv().await.expect("connection closed unexpectedly")
    }

    async fn register(addr: SocketAddr, nickname: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(json!({"type": "register", "nickname": nickname, "password": "secret"}))
            .await;
        assert_eq!(client.expect().await, ServerMessage::success("registration successful"));
        client
    }
}

#[tokio::test]
async fn chat_fans_out_to_everyone_but_the_sender() {
    let server = start_server().await;
    let mut ann = Client::register(server.tcp, "ann").await;
    let mut bob = Client::register(server.tcp, "bob").await;
    let mut cat = Client::register(server.tcp, "cat").await;

    ann.send(json!({"type": "message", "content": "hi all"})).await;

    let expected = ServerMessage::Message {
        sender: "ann".to_string(),
        content: "hi all".to_string(),
    };
    assert_eq!(bob.expect().await, expected);
    assert_eq!(cat.expect().await, expected);

    // ann's next message is the reply to her own request, not her chat line
    ann.send(json!({"type": "list_files"})).await;
    assert_eq!(ann.expect().await, ServerMessage::FilesList { files: vec![] });
}

#[tokio::test]
async fn login_after_register_and_rejections() {
    let server = start_server().await;
    drop(Client::register(server.tcp, "dora").await);

    let mut again = Client::connect(server.tcp).await;
    again
        .send(json!({"type": "register", "nickname": "dora", "password": "other"}))
        .await;
    assert_eq!(again.expect().await, ServerMessage::error("user already exists"));
    assert_eq!(again.recv().await, None);

    let mut wrong = Client::connect(server.tcp).await;
    wrong
        .send(json!({"type": "login", "nickname": "dora", "password": "wrong"}))
        .await;
    assert_eq!(wrong.expect().await, ServerMessage::error("invalid credentials"));
    assert_eq!(wrong.recv().await, None);

    let mut right = Client::connect(server.tcp).await;
    right
        .send(json!({"type": "login", "nickname": "dora", "password": "secret"}))
        .await;
    assert_eq!(right.expect().await, ServerMessage::success("login successful"));
}

#[tokio::test]
async fn upload_then_download_round_trip() {
    let server = start_server().await;
    let mut ann = Client::register(server.tcp, "ann").await;
    let mut bob = Client::register(server.tcp, "bob").await;

    let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let parts: Vec<&[u8]> = data.chunks(4096).collect();
    for (i, part) in parts.iter().enumerate() {
        ann.send(json!({
            "type": "file",
            "file_name": "photo_2024.png",
            "file_size": "9.77 KB",
            "total_chunks": parts.len(),
            "current_chunk": i + 1,
            "file_data": hex::encode(part),
            "sender": "ann",
            "date": "2024-03-03 09:30:00",
        }))
        .await;
    }

    for client in [&mut ann, &mut bob] {
        match client.expect().await {
            ServerMessage::NewFile(entry) => {
                assert_eq!(entry.file_name, "photo_2024.png");
                assert_eq!(entry.file_type, FileKind::Image);
                assert_eq!(entry.sender, "ann");
                assert_eq!(entry.date, "2024-03-03 09:30:00");
            }
            other => panic!("expected new_file, got {other:?}"),
        }
    }

    bob.send(json!({"type": "list_files"})).await;
    match bob.expect().await {
        ServerMessage::FilesList { files } => {
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].file_name, "photo_2024.png");
            assert_eq!(files[0].sender, "ann");
            assert_eq!(files[0].file_size, "9.77 KB");
        }
        other => panic!("expected files_list, got {other:?}"),
    }

    bob.send(json!({"type": "download_file", "file_name": "photo_2024.png"})).await;
    let total = match bob.expect().await {
        ServerMessage::FileInfo { total_chunks, file_type, sender, .. } => {
            assert_eq!(file_type, FileKind::Image);
            assert_eq!(sender, "ann");
            total_chunks
        }
        other => panic!("expected file_info, got {other:?}"),
    };

    let mut received = Vec::new();
    for expected in 1..=total {
        match bob.expect().await {
            ServerMessage::FileChunk { chunk_number, total_chunks, file_data, .. } => {
                assert_eq!(chunk_number, expected);
                assert_eq!(total_chunks, total);
                received.extend(hex::decode(file_data).unwrap());
            }
            other => panic!("expected file_chunk, got {other:?}"),
        }
    }
    assert_eq!(
        bob.expect().await,
        ServerMessage::FileComplete {
            file_name: "photo_2024.png".to_string()
        }
    );
    assert_eq!(received, data);
}

#[tokio::test]
async fn large_download_arrives_in_numbered_chunks() {
    let server = start_server().await;
    // 700 KiB is past the 512 KiB tier boundary: two chunks
    let data: Vec<u8> = (0..700 * 1024u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(server.files_dir.join("ann_scan.pdf"), &data).unwrap();

    let mut bob = Client::register(server.tcp, "bob").await;
    bob.send(json!({"type": "download_file", "file_name": "scan.pdf"})).await;
    match bob.expect().await {
        ServerMessage::FileInfo { total_chunks, file_type, file_size, .. } => {
            assert_eq!(total_chunks, 2);
            assert_eq!(file_type, FileKind::Document);
            assert_eq!(file_size, "700 KB");
        }
        other => panic!("expected file_info, got {other:?}"),
    }

    let mut received = Vec::new();
    for expected in 1..=2 {
        match bob.expect().await {
            ServerMessage::FileChunk { chunk_number, file_data, .. } => {
                assert_eq!(chunk_number, expected);
                received.extend(hex::decode(file_data).unwrap());
            }
            other => panic!("expected file_chunk, got {other:?}"),
        }
    }
    assert!(matches!(bob.expect().await, ServerMessage::FileComplete { .. }));
    assert_eq!(received, data);
}

#[tokio::test]
async fn oversized_line_ends_the_session() {
    let server = start_server().await;
    let mut ann = Client::register(server.tcp, "ann").await;

    let huge = "a".repeat(128 * 1024);
    let _ = ann.writer.write_all(huge.as_bytes()).await;

    // the error reply can be lost to a reset since the rest of the line is
    // never read, but the connection must end either way
    if let Some(message) = ann.recv().await {
        match message {
            ServerMessage::Response { status, .. } => assert_eq!(status, Status::Error),
            other => panic!("expected an error response, got {other:?}"),
        }
        assert_eq!(ann.recv().await, None);
    }
}

#[tokio::test]
async fn disconnected_client_does_not_block_chat() {
    let server = start_server().await;
    let mut ann = Client::register(server.tcp, "ann").await;
    let gone = Client::register(server.tcp, "gone").await;
    let mut bob = Client::register(server.tcp, "bob").await;
    drop(gone);

    for n in 0..3 {
        ann.send(json!({"type": "message", "content": format!("msg {n}")})).await;
        match bob.expect().await {
            ServerMessage::Message { content, .. } => assert_eq!(content, format!("msg {n}")),
            other => panic!("expected chat, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn discovery_reports_tcp_port() {
    let server = start_server().await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"DISCOVER_SERVER", server.udp).await.unwrap();

    let mut buf = [0u8; 256];
    let (len, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("no discovery reply")
        .unwrap();
    let reply = std::str::from_utf8(&buf[..len]).unwrap();
    let advertised = parse_discovery_reply(reply).expect("well-formed reply");
    assert_eq!(advertised.port(), server.tcp.port());
    assert!(reply.starts_with("SERVER_IP:"));
}
