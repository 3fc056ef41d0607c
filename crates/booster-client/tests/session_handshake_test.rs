//! Exercises `transport::open_session` against a minimal fake TCP server
//! speaking the `ClientSessionMeta` request/reply exchange directly, since
//! pulling in `booster-server` from this crate's tests would reach the wrong
//! direction across the workspace boundary.

use std::time::Duration;

use booster_client::transport::open_session;
use booster_core::{
    BoostFlags, CpuArch, ProgramIdentity, RuntimeFlagSnapshot, SessionHandshakeReply,
    SessionHandshakeRequest, UnsupportedClientPayload,
};
use booster_proto::{Message, MessageReader, MessageType};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

fn sample_identity() -> ProgramIdentity {
    ProgramIdentity {
        cpu_arch: CpuArch::X86,
        runtime_version: 1,
        runtime_build_info: "test-jdk".to_string(),
        program_name: "App".to_string(),
        program_entry: "App".to_string(),
        is_jar: false,
        classpath_names_hash: 0,
        classpath_mtimes_hash: 0,
        agent_names_hash: 0,
        strict_command_line: None,
        boost_flags: BoostFlags { clr: true, cds: true, aot: false, pgo: false },
        runtime_flags: RuntimeFlagSnapshot::default(),
    }
}

async fn recv_one(socket: &mut TcpStream) -> Message {
    let mut reader = MessageReader::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(message) = reader.next_message().unwrap() {
            return message;
        }
        let n = socket.read(&mut buf).await.unwrap();
        reader.push(&buf[..n]);
    }
}

#[tokio::test]
async fn open_session_succeeds_against_a_replying_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request_message = recv_one(&mut socket).await;
        assert_eq!(request_message.msg_type, MessageType::ClientSessionMeta);
        let request = SessionHandshakeRequest::decode(&request_message.body).unwrap();
        assert_eq!(request.program_identity, sample_identity());

        let reply = SessionHandshakeReply {
            stream_id: 0,
            server_random_id: 0xABCD,
            session_id: 7,
            program_id: 3,
            has_remote_clr: true,
            has_remote_cds: false,
            has_remote_aot: false,
        };
        let bytes =
            Message::new(MessageType::ClientSessionMeta, reply.encode_to_vec()).encode_to_vec().unwrap();
        socket.write_all(&bytes).await.unwrap();
    });

    let (_, reply) = open_session(addr, Duration::from_secs(2), 0x1122_3344, sample_identity())
        .await
        .expect("handshake should succeed");

    assert_eq!(reply.session_id, 7);
    assert!(reply.has_remote_clr);
    assert!(!reply.has_remote_cds);

    server.await.unwrap();
}

#[tokio::test]
async fn open_session_surfaces_server_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = recv_one(&mut socket).await;
        let payload = UnsupportedClientPayload { reason: "cpu-arch mismatch".to_string() };
        let bytes =
            Message::new(MessageType::UnsupportedClient, payload.encode_to_vec()).encode_to_vec().unwrap();
        socket.write_all(&bytes).await.unwrap();
    });

    let err = open_session(addr, Duration::from_secs(2), 1, sample_identity())
        .await
        .expect_err("rejection should surface as an error");
    assert!(matches!(err, booster_client::ClientError::Rejected { reason } if reason == "cpu-arch mismatch"));

    server.await.unwrap();
}
