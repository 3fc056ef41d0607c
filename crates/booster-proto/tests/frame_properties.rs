//! Cross-module property tests for the framing + composite codec layers
//! working together, mirroring `lockframe-proto/tests/frame_properties.rs`'s
//! placement (integration tests, not `#[cfg(test)]` unit tests, since they
//! exercise the public API surface across modules).

use booster_proto::{Message, MessageBuffer, MessageReader, MessageType};
use proptest::prelude::*;

fn arb_session_meta_body() -> impl Strategy<Value = Vec<u8>> {
    (any::<u32>(), any::<u64>()).prop_map(|(magic, client_random_id)| {
        let mut buf = MessageBuffer::new();
        buf.write_u32(magic);
        buf.write_u64(client_random_id);
        buf.into_bytes()
    })
}

proptest! {
    /// Any well-formed `ClientSessionMeta` body round-trips through the
    /// message-level framing, and the base-type fields decode back intact.
    #[test]
    fn client_session_meta_round_trips_through_framing(body in arb_session_meta_body()) {
        let msg = Message::new(MessageType::ClientSessionMeta, body.clone());
        let bytes = msg.encode_to_vec().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        prop_assert_eq!(decoded.msg_type, MessageType::ClientSessionMeta);
        prop_assert_eq!(decoded.body.as_ref(), body.as_slice());
    }

    /// Three arbitrary messages sent back-to-back on a stream, with the
    /// transport splitting and merging reads arbitrarily, are always
    /// recovered in order (SPEC_FULL.md §8, "Framing").
    #[test]
    fn three_messages_survive_arbitrary_chunking(
        bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 3),
        split_points in prop::collection::vec(1usize..7, 1..4),
    ) {
        let msgs: Vec<Message> = bodies
            .into_iter()
            .map(|b| Message::new(MessageType::Heartbeat, b))
            .collect();
        let mut all_bytes = Vec::new();
        for m in &msgs {
            all_bytes.extend(m.encode_to_vec().unwrap());
        }

        let mut reader = MessageReader::new();
        let mut offset = 0;
        for chunk_len in split_points {
            let end = (offset + chunk_len).min(all_bytes.len());
            reader.push(&all_bytes[offset..end]);
            offset = end;
            if offset >= all_bytes.len() {
                break;
            }
        }
        if offset < all_bytes.len() {
            reader.push(&all_bytes[offset..]);
        }

        let mut decoded = Vec::new();
        while let Some(m) = reader.next_message().unwrap() {
            decoded.push(m);
        }
        prop_assert_eq!(decoded, msgs);
    }
}
