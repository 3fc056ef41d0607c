//! Cache-file fetch (server→client) and sync (client→server) exchanges
//! (SPEC_FULL.md §4.7, §4.8).
//!
//! Built directly on `booster-proto::FileWrapper`'s chunk framing, not on
//! `booster-server::handlers::IncrementalFileReceiver` — that type lives in
//! the server crate and a dependency the other way would be backwards, so
//! the small accumulation loop below is its client-side counterpart.

use std::path::Path;

use booster_core::ArtifactKind;
use booster_proto::{FileWrapper, MessageType};

use crate::{error::ClientError, transport::MessageStream};

async fn receive_file(stream: &mut MessageStream) -> Result<Option<Vec<u8>>, ClientError> {
    let first = stream.recv_expecting(MessageType::FileSegment).await?;
    let (parsed, _) = FileWrapper::decode_chunk(&first.body)?;
    let Some((file_size, first_bytes)) = parsed else {
        return Ok(None);
    };

    let mut accumulated = first_bytes;
    while (accumulated.len() as u64) < u64::from(file_size) {
        let message = stream.recv_expecting(MessageType::FileSegment).await?;
        let (parsed, _) = FileWrapper::decode_chunk(&message.body)?;
        let (_, bytes) = parsed
            .ok_or_else(|| booster_proto::ProtocolError::BadArgData("transfer ended early".into()))?;
        accumulated.extend_from_slice(&bytes);
    }
    Ok(Some(accumulated))
}

/// Fetches one artifact kind from the server and writes it to `target`
/// (SPEC_FULL.md §4.7 `Get*Cache` handlers). Returns `false` without writing
/// anything if the server has no such artifact cached.
///
/// # Errors
///
/// Returns a [`ClientError`] on protocol or I/O failure.
pub async fn fetch_artifact(
    stream: &mut MessageStream,
    kind: ArtifactKind,
    target: &Path,
) -> Result<bool, ClientError> {
    let request_type = match kind {
        ArtifactKind::Clr => MessageType::GetClassLoaderResourceCache,
        ArtifactKind::AggressiveCds => MessageType::GetAggressiveCdsCache,
        ArtifactKind::AotStatic | ArtifactKind::AotPgo => MessageType::GetLazyAotCache,
        ArtifactKind::DynamicCds => {
            return Err(ClientError::Connection(booster_core::ConnectionError::InvalidPayload {
                expected: "client-fetchable artifact kind",
                msg_type: MessageType::FileSegment.to_u16(),
            }));
        },
    };
    stream.send(request_type, Vec::new()).await?;
    match receive_file(stream).await? {
        Some(bytes) => {
            std::fs::write(target, bytes).map_err(ClientError::Transport)?;
            Ok(true)
        },
        None => Ok(false),
    }
}

/// Runs the full `CacheFilesSyncTask` exchange on a fresh stream: offers
/// every artifact in `offered` (the client-sourced kinds this run is
/// eligible to contribute and the server doesn't already have), responding
/// to each `CacheClassLoaderResource`/`CacheAggressiveCds` request the
/// server sends back with the file's contents, then signals the end of the
/// phase.
///
/// # Errors
///
/// Returns a [`ClientError`] on protocol or I/O failure, or if the server
/// requests a kind not present in `offered`.
pub async fn run_cache_files_sync(
    stream: &mut MessageStream,
    mut offered: Vec<(ArtifactKind, std::path::PathBuf)>,
) -> Result<(), ClientError> {
    stream.send(MessageType::CacheFilesSyncTask, Vec::new()).await?;

    while !offered.is_empty() {
        let message = stream.recv().await?;
        let kind = match message.msg_type {
            MessageType::CacheClassLoaderResource => ArtifactKind::Clr,
            MessageType::CacheAggressiveCds => ArtifactKind::AggressiveCds,
            other => {
                return Err(ClientError::Connection(booster_core::ConnectionError::UnexpectedFrame {
                    state: booster_core::StreamState::Active,
                    msg_type: other.to_u16(),
                }));
            },
        };
        let Some(index) = offered.iter().position(|(k, _)| *k == kind) else {
            return Err(ClientError::Connection(booster_core::ConnectionError::InvalidPayload {
                expected: "a previously offered artifact kind",
                msg_type: message.msg_type.to_u16(),
            }));
        };
        let (_, path) = offered.remove(index);

        let mut body = Vec::new();
        FileWrapper::send_file(&path, &mut body)?;
        send_chunked(stream, &body).await?;
    }
    stream.send(MessageType::NoMoreRequests, Vec::new()).await?;
    Ok(())
}

/// Splits the concatenated chunk-record stream `FileWrapper::send_file`
/// writes into individual `FileSegment` messages.
async fn send_chunked(stream: &mut MessageStream, records: &[u8]) -> Result<(), ClientError> {
    let mut rest = records;
    loop {
        let (parsed, remainder) = FileWrapper::decode_chunk(rest)?;
        let consumed = rest.len() - remainder.len();
        stream.send(MessageType::FileSegment, rest[..consumed].to_vec()).await?;
        let is_last = parsed.is_none() || remainder.is_empty();
        rest = remainder;
        if is_last {
            break;
        }
    }
    Ok(())
}
