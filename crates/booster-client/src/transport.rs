//! Framed TCP transport to the booster server (SPEC_FULL.md §4.2, §4.5).
//!
//! One [`MessageStream`] wraps one TCP connection the same way
//! `booster-server::listener` wraps an accepted socket: a [`MessageReader`]
//! buffers partial frames across reads, and every read/write is bounded by
//! `BoosterTimeout`.

use std::{io, net::SocketAddr, time::Duration};

use booster_core::{
    ConnectionError, ProgramIdentity, SessionHandshakeReply, SessionHandshakeRequest,
    StreamHandshakeReply, StreamHandshakeRequest,
};
use booster_proto::{Message, MessageReader, MessageType};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::ClientError;

/// `BoosterTimeout`'s default: the ceiling on any single socket operation
/// (SPEC_FULL.md §6).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(4000);

/// Wire-compatibility magic this build speaks (SPEC_FULL.md §4.1, §7).
pub const PROTOCOL_MAGIC: u32 = 0xB005_7AC0;

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "socket operation timed out")
}

/// A single framed TCP connection, one [`Message`] at a time.
pub struct MessageStream {
    socket: TcpStream,
    reader: MessageReader,
    timeout: Duration,
}

impl MessageStream {
    /// Opens a new TCP connection to `addr`.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError::Transport`] if the connection cannot be
    /// established within `timeout`.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        let socket = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out())??;
        let _ = socket.set_nodelay(true);
        Ok(Self { socket, reader: MessageReader::new(), timeout })
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError::Protocol`] if `body` and `msg_type` exceed
    /// the wire size limit, or [`ClientError::Transport`] if the write does
    /// not complete within the configured timeout.
    pub async fn send(&mut self, msg_type: MessageType, body: Vec<u8>) -> Result<(), ClientError> {
        let message = Message::new(msg_type, body);
        let bytes = message.encode_to_vec()?;
        tokio::time::timeout(self.timeout, self.socket.write_all(&bytes))
            .await
            .map_err(|_| timed_out())??;
        Ok(())
    }

    /// Receives the next complete message, reading further bytes off the
    /// socket as needed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] on a malformed frame,
    /// [`ClientError::Transport`] if the peer closes the connection or the
    /// read does not complete within the configured timeout.
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        loop {
            if let Some(message) = self.reader.next_message()? {
                return Ok(message);
            }
            let mut buf = [0u8; 8192];
            let n = tokio::time::timeout(self.timeout, self.socket.read(&mut buf))
                .await
                .map_err(|_| timed_out())??;
            if n == 0 {
                return Err(ClientError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed connection",
                )));
            }
            self.reader.push(&buf[..n]);
        }
    }

    /// Receives the next message and requires it be of `expected` type,
    /// surfacing anything else as [`ConnectionError::UnexpectedFrame`].
    ///
    /// # Errors
    ///
    /// See [`Self::recv`]; additionally returns
    /// [`ClientError::Connection`] wrapping `UnexpectedFrame` if a different
    /// message type arrives.
    pub async fn recv_expecting(&mut self, expected: MessageType) -> Result<Message, ClientError> {
        let message = self.recv().await?;
        if message.msg_type != expected {
            return Err(ClientError::Connection(ConnectionError::UnexpectedFrame {
                state: booster_core::StreamState::Init,
                msg_type: message.msg_type.to_u16(),
            }));
        }
        Ok(message)
    }
}

/// What happened when trying to open a stream against an existing session.
#[derive(Debug)]
pub enum StreamOpenOutcome {
    /// The stream opened normally.
    Ready(MessageStream, StreamHandshakeReply),
    /// The server no longer recognises this session (restarted since the
    /// session was established, SPEC_FULL.md §8 scenario 3 "stale session
    /// reconnect"); the caller must redo the full session handshake.
    SessionStale(MessageStream),
}

/// Performs the session handshake (`ClientSessionMeta` request/reply) on a
/// fresh connection (SPEC_FULL.md §4.2).
///
/// # Errors
///
/// Returns [`ConnectionError::IncompatibleRpc`] if the server's reply
/// indicates a magic mismatch (surfaced by the server closing with
/// `UnsupportedClient` instead of replying), or any [`MessageStream`] error.
pub async fn open_session(
    addr: SocketAddr,
    timeout: Duration,
    client_random_id: u64,
    identity: ProgramIdentity,
) -> Result<(MessageStream, SessionHandshakeReply), ClientError> {
    let mut stream = MessageStream::connect(addr, timeout).await?;
    let request = SessionHandshakeRequest { magic: PROTOCOL_MAGIC, client_random_id, program_identity: identity };
    stream.send(MessageType::ClientSessionMeta, request.encode_to_vec()).await?;

    let message = stream.recv().await?;
    if message.msg_type == MessageType::UnsupportedClient {
        let payload = booster_core::UnsupportedClientPayload::decode(&message.body)?;
        return Err(ClientError::Rejected { reason: payload.reason });
    }
    if message.msg_type != MessageType::ClientSessionMeta {
        return Err(ClientError::Connection(ConnectionError::UnexpectedFrame {
            state: booster_core::StreamState::Init,
            msg_type: message.msg_type.to_u16(),
        }));
    }
    let reply = SessionHandshakeReply::decode(&message.body)?;
    Ok((stream, reply))
}

/// Opens a new stream against an already-established session
/// (`ClientStreamMeta`, SPEC_FULL.md §4.2).
///
/// # Errors
///
/// Returns any [`MessageStream`] error.
pub async fn open_stream(
    addr: SocketAddr,
    timeout: Duration,
    session_id: u32,
    client_random_id: u64,
    server_random_id: u64,
) -> Result<StreamOpenOutcome, ClientError> {
    let mut stream = MessageStream::connect(addr, timeout).await?;
    let request = StreamHandshakeRequest { session_id, client_random_id, server_random_id };
    stream.send(MessageType::ClientStreamMeta, request.encode_to_vec()).await?;

    let message = stream.recv().await?;
    match message.msg_type {
        MessageType::ClientStreamMeta => {
            let reply = StreamHandshakeReply::decode(&message.body)?;
            Ok(StreamOpenOutcome::Ready(stream, reply))
        },
        MessageType::ClientSessionMetaAgain => Ok(StreamOpenOutcome::SessionStale(stream)),
        other => Err(ClientError::Connection(ConnectionError::UnexpectedFrame {
            state: booster_core::StreamState::Init,
            msg_type: other.to_u16(),
        })),
    }
}
