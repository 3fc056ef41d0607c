//! Message framing: `{size: u32 LE, type: u16 LE, body}`.
//!
//! Grounded on `lockframe-proto`'s `FrameHeader`/`Frame` split (fixed header +
//! `Bytes` payload, `payload_size` computed from the payload, explicit
//! `encode`/`decode`), shrunk from that crate's 128-byte zerocopy header to
//! the 6-byte header this protocol's wire format specifies, and with decode
//! built around a persistent [`MessageReader`] so the "overflow carry"
//! property in SPEC_FULL.md §8 holds: bytes read past one frame's boundary
//! are retained for the next `next_message()` call rather than discarded.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    message_type::MessageType,
};

/// Length of the fixed header in bytes: `u32 size | u16 type`.
pub const HEADER_LEN: u32 = 6;

/// Hard ceiling on a single frame's total size, matching SPEC_FULL.md §4.1's
/// "capped at 2 GiB".
pub const MAX_MESSAGE_SIZE: u32 = 2 * 1024 * 1024 * 1024;

/// A single decoded protocol message: header plus body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The message's type tag.
    pub msg_type: MessageType,
    /// Body bytes, excluding the 6-byte header.
    pub body: Bytes,
}

impl Message {
    /// Builds a message from a type tag and body bytes.
    #[must_use]
    pub fn new(msg_type: MessageType, body: impl Into<Bytes>) -> Self {
        Self { msg_type, body: body.into() }
    }

    /// Total wire size of this message, including the header.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MessageTooLarge`] if the body is large enough
    /// that `size` would not fit in a `u32` or would exceed
    /// [`MAX_MESSAGE_SIZE`].
    pub fn wire_size(&self) -> Result<u32> {
        let total = u64::from(HEADER_LEN) + self.body.len() as u64;
        let size = u32::try_from(total).map_err(|_| ProtocolError::MessageTooLarge {
            size: u32::MAX,
            max: MAX_MESSAGE_SIZE,
        })?;
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size, max: MAX_MESSAGE_SIZE });
        }
        Ok(size)
    }

    /// Encodes this message's header and body into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MessageTooLarge`] if the message exceeds
    /// [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let size = self.wire_size()?;
        dst.put_u32_le(size);
        dst.put_u16_le(self.msg_type.to_u16());
        dst.put_slice(&self.body);
        Ok(())
    }

    /// Encodes this message into a freshly allocated buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MessageTooLarge`] if the message exceeds
    /// [`MAX_MESSAGE_SIZE`].
    pub fn encode_to_vec(&self) -> Result<Vec<u8>> {
        let size = self.wire_size()? as usize;
        let mut buf = Vec::with_capacity(size);
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a single message from an exact, complete byte slice.
    ///
    /// For streaming decode with overflow carry, use [`MessageReader`]
    /// instead.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if `bytes` is shorter than the header, the
    /// declared size doesn't match `bytes.len()`, or the type tag is unknown.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::parse(bytes)?;
        if bytes.len() < header.size as usize {
            return Err(ProtocolError::TruncatedPayload {
                declared: header.size,
                got: bytes.len(),
            });
        }
        let body = Bytes::copy_from_slice(&bytes[HEADER_LEN as usize..header.size as usize]);
        Ok(Self { msg_type: header.msg_type, body })
    }
}

/// The parsed, but not yet body-validated, contents of a 6-byte header.
struct FrameHeader {
    size: u32,
    msg_type: MessageType,
}

impl FrameHeader {
    /// Parses the header from the front of `bytes`. `bytes` need not contain
    /// the full frame, only at least [`HEADER_LEN`] bytes.
    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN as usize {
            return Err(ProtocolError::TruncatedHeader {
                got: bytes.len(),
                need: HEADER_LEN as usize,
            });
        }
        let mut cursor = bytes;
        let size = cursor.get_u32_le();
        let raw_type = cursor.get_u16_le();

        if size < HEADER_LEN {
            return Err(ProtocolError::BadMsgSize { size, min: HEADER_LEN });
        }
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size, max: MAX_MESSAGE_SIZE });
        }
        let msg_type =
            MessageType::from_u16(raw_type).ok_or(ProtocolError::BadMsgType(raw_type))?;

        Ok(Self { size, msg_type })
    }
}

/// Streaming frame decoder with overflow carry.
///
/// Bytes arriving from the transport are pushed in with [`Self::push`]; each
/// call to [`Self::next_message`] returns a complete [`Message`] once enough
/// bytes have accumulated, and leaves any bytes belonging to the *next* frame
/// untouched in the internal buffer — so a socket read that returns two
/// frames merged, or one frame split across two reads, is handled
/// transparently and without an extra syscall when the overflow already
/// contains a complete frame (SPEC_FULL.md §8, "Overflow carry").
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: BytesMut,
}

impl MessageReader {
    /// Creates an empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Appends freshly read transport bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes currently buffered but not yet consumed.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode one complete message from the buffered bytes.
    ///
    /// Returns `Ok(None)` if fewer bytes than a full frame are currently
    /// buffered (the caller should read more from the transport and push
    /// again). Returns `Ok(Some(_))` and advances past the consumed frame,
    /// retaining any trailing bytes for the next call.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the buffered header is malformed (bad
    /// size, unknown type, or oversized). These are stream-fatal: the caller
    /// should close the connection rather than call `next_message` again.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < HEADER_LEN as usize {
            return Ok(None);
        }
        let header = FrameHeader::parse(&self.buf)?;
        if self.buf.len() < header.size as usize {
            // Grow toward the next power-of-two capacity >= declared size,
            // capped at MAX_MESSAGE_SIZE, so repeated partial reads don't
            // thrash reallocation.
            let target = header.size.next_power_of_two().min(MAX_MESSAGE_SIZE) as usize;
            if self.buf.capacity() < target {
                self.buf.reserve(target - self.buf.len());
            }
            return Ok(None);
        }

        let mut frame = self.buf.split_to(header.size as usize);
        frame.advance(HEADER_LEN as usize);
        Ok(Some(Message { msg_type: header.msg_type, body: frame.freeze() }))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_message() -> impl Strategy<Value = Message> {
        (
            prop::sample::select(MessageType::ALL),
            prop::collection::vec(any::<u8>(), 0..256),
        )
            .prop_map(|(mt, body)| Message::new(*mt, body))
    }

    proptest! {
        #[test]
        fn round_trip(msg in arb_message()) {
            let bytes = msg.encode_to_vec().unwrap();
            let decoded = Message::decode(&bytes).unwrap();
            prop_assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn reject_short_buffer() {
        let err = Message::decode(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedHeader { .. }));
    }

    #[test]
    fn reject_size_below_header_len() {
        let mut bytes = vec![0u8; 6];
        bytes[0..4].copy_from_slice(&3u32.to_le_bytes());
        let err = Message::decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::BadMsgSize { .. }));
    }

    #[test]
    fn reject_unknown_type() {
        let mut bytes = vec![0u8; 6];
        bytes[0..4].copy_from_slice(&6u32.to_le_bytes());
        bytes[4..6].copy_from_slice(&9999u16.to_le_bytes());
        let err = Message::decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::BadMsgType(9999)));
    }

    #[test]
    fn reader_yields_two_merged_frames_in_order() {
        let a = Message::new(MessageType::Heartbeat, &b"AA"[..]);
        let b = Message::new(MessageType::Heartbeat, &b"BBB"[..]);
        let mut merged = a.encode_to_vec().unwrap();
        merged.extend(b.encode_to_vec().unwrap());

        let mut reader = MessageReader::new();
        reader.push(&merged);

        assert_eq!(reader.next_message().unwrap(), Some(a));
        assert_eq!(reader.next_message().unwrap(), Some(b));
        assert_eq!(reader.next_message().unwrap(), None);
    }

    #[test]
    fn reader_yields_frame_split_across_pushes() {
        let msg = Message::new(MessageType::Heartbeat, &b"hello"[..]);
        let bytes = msg.encode_to_vec().unwrap();
        let (first, second) = bytes.split_at(4);

        let mut reader = MessageReader::new();
        reader.push(first);
        assert_eq!(reader.next_message().unwrap(), None);

        reader.push(second);
        assert_eq!(reader.next_message().unwrap(), Some(msg));
    }

    #[test]
    fn reject_oversized_declared_size() {
        let mut bytes = vec![0u8; 6];
        bytes[0..4].copy_from_slice(&(MAX_MESSAGE_SIZE + 1).to_le_bytes());
        bytes[4..6].copy_from_slice(&MessageType::Heartbeat.to_u16().to_le_bytes());
        let err = Message::decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }
}
