//! Daemon stream: the long-lived connection the server heartbeat-sweeps for
//! the lifetime of a client run (SPEC_FULL.md §4.6).
//!
//! Mirrors `booster-server::control`'s tick-driven sweep from the other
//! side: this crate never initiates a heartbeat, it only opens the stream
//! once via `ClientDaemonTask` and then echoes back whatever `Heartbeat`
//! frames the server's control loop sends, for as long as the connection
//! stays open.

use booster_core::HeartbeatPayload;
use booster_proto::MessageType;

use crate::{error::ClientError, transport::MessageStream};

/// Marks `stream` as this session's daemon stream and then echoes
/// `Heartbeat` frames until the connection closes or errors.
///
/// Returns normally (`Ok(())`) when the peer closes the connection
/// cleanly — this is the expected way a daemon stream ends, since neither
/// side has a "stop the daemon" message; shutdown happens by simply not
/// reconnecting (SPEC_FULL.md §4.8).
///
/// # Errors
///
/// Returns a [`ClientError`] if the stream errors or a non-heartbeat frame
/// arrives on it.
pub async fn run(mut stream: MessageStream) -> Result<(), ClientError> {
    stream.send(MessageType::ClientDaemonTask, Vec::new()).await?;

    loop {
        let message = match stream.recv().await {
            Ok(message) => message,
            Err(ClientError::Transport(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            },
            Err(err) => return Err(err),
        };

        if message.msg_type != MessageType::Heartbeat {
            return Err(ClientError::Connection(booster_core::ConnectionError::UnexpectedFrame {
                state: booster_core::StreamState::Active,
                msg_type: message.msg_type.to_u16(),
            }));
        }

        let payload = HeartbeatPayload::decode(&message.body)?;
        stream.send(MessageType::Heartbeat, payload.encode_to_vec()).await?;
    }
}
