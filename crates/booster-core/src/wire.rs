//! Wire encode/decode for the handful of message bodies `booster-server`
//! and `booster-client` exchange directly (SPEC_FULL.md §4.1, §4.2, §4.7).
//!
//! Grounded on `booster-proto::buffer`'s composite ("with meta") codec and
//! `booster-proto::wrappers::StringWrapper`; this module is where
//! `booster-core`'s domain types cross into bytes, the same seam
//! `lockframe-core`'s payload types occupy one layer above
//! `lockframe-proto`'s raw CBOR frame. Bodies for message types whose
//! payload is itself out of scope (the class-loader/klass/method locator
//! exchange, SPEC_FULL.md §1) are not encoded here — those are orchestrated
//! through `booster-server::handlers`'s collaborator traits instead.

use booster_proto::{MessageBuffer, ProtocolError, Result, StringWrapper};

use crate::identity::{BoostFlags, CpuArch, ProgramIdentity, RuntimeFlagSnapshot};

fn write_required_string(buf: &mut MessageBuffer, s: &str) {
    StringWrapper { value: Some(s.to_string()) }.write(buf);
}

fn read_required_string(buf: &mut MessageBuffer, field: &'static str) -> Result<String> {
    StringWrapper::read(buf)?
        .value
        .ok_or_else(|| ProtocolError::BadArgData(format!("missing required field: {field}")))
}

impl ProgramIdentity {
    /// Encodes this identity into `buf` (the `program_identity` field of a
    /// `ClientSessionMeta` body).
    pub fn encode(&self, buf: &mut MessageBuffer) {
        buf.write_u8(self.cpu_arch.to_wire());
        buf.write_u64(self.runtime_version);
        write_required_string(buf, &self.runtime_build_info);
        write_required_string(buf, &self.program_name);
        write_required_string(buf, &self.program_entry);
        buf.write_bool(self.is_jar);
        buf.write_u32(self.classpath_names_hash);
        buf.write_u32(self.classpath_mtimes_hash);
        buf.write_u32(self.agent_names_hash);
        StringWrapper { value: self.strict_command_line.clone() }.write(buf);
        buf.write_bool(self.boost_flags.clr);
        buf.write_bool(self.boost_flags.cds);
        buf.write_bool(self.boost_flags.aot);
        buf.write_bool(self.boost_flags.pgo);
        let flags = self.runtime_flags.as_slice();
        buf.write_u32(flags.len() as u32);
        for (name, value) in flags {
            write_required_string(buf, name);
            write_required_string(buf, value);
        }
    }

    /// Decodes an identity encoded by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if a required field is missing, malformed,
    /// or the buffer is truncated.
    pub fn decode(buf: &mut MessageBuffer) -> Result<Self> {
        let cpu_arch = CpuArch::from_wire(buf.read_u8()?);
        let runtime_version = buf.read_u64()?;
        let runtime_build_info = read_required_string(buf, "runtime_build_info")?;
        let program_name = read_required_string(buf, "program_name")?;
        let program_entry = read_required_string(buf, "program_entry")?;
        let is_jar = buf.read_bool()?;
        let classpath_names_hash = buf.read_u32()?;
        let classpath_mtimes_hash = buf.read_u32()?;
        let agent_names_hash = buf.read_u32()?;
        let strict_command_line = StringWrapper::read(buf)?.value;
        let boost_flags = BoostFlags {
            clr: buf.read_bool()?,
            cds: buf.read_bool()?,
            aot: buf.read_bool()?,
            pgo: buf.read_bool()?,
        };
        let flag_count = buf.read_u32()?;
        let mut flags = Vec::with_capacity(flag_count as usize);
        for _ in 0..flag_count {
            let name = read_required_string(buf, "runtime_flag.name")?;
            let value = read_required_string(buf, "runtime_flag.value")?;
            flags.push((name, value));
        }

        Ok(Self {
            cpu_arch,
            runtime_version,
            runtime_build_info,
            program_name,
            program_entry,
            is_jar,
            classpath_names_hash,
            classpath_mtimes_hash,
            agent_names_hash,
            strict_command_line,
            boost_flags,
            runtime_flags: RuntimeFlagSnapshot::new(flags),
        })
    }
}

/// Body of a `ClientSessionMeta` request: `{magic, client_random_id,
/// program_identity}` (SPEC_FULL.md §4.2, §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandshakeRequest {
    /// Wire-compatibility magic the client was built with.
    pub magic: u32,
    /// Client-chosen random id, re-presented on every subsequent stream.
    pub client_random_id: u64,
    /// The client's program identity.
    pub program_identity: ProgramIdentity,
}

impl SessionHandshakeRequest {
    /// Encodes this request into a standalone message body.
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = MessageBuffer::new();
        buf.write_u32(self.magic);
        buf.write_u64(self.client_random_id);
        self.program_identity.encode(&mut buf);
        buf.into_bytes()
    }

    /// Decodes a request body produced by [`Self::encode_to_vec`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the body is truncated or malformed.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut buf = MessageBuffer::from_bytes(body.to_vec());
        let magic = buf.read_u32()?;
        let client_random_id = buf.read_u64()?;
        let program_identity = ProgramIdentity::decode(&mut buf)?;
        Ok(Self { magic, client_random_id, program_identity })
    }
}

/// Reply to a `ClientSessionMeta` request, carried back on the same
/// `MessageType` (`booster-proto` has no distinct reply variant; SPEC_FULL.md
/// §4.7's directionality table marks `ClientSessionMeta` "both ways").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandshakeReply {
    /// The stream id assigned to this (the handshake) stream.
    pub stream_id: u32,
    /// Server-chosen random id the client must echo on subsequent streams.
    pub server_random_id: u64,
    /// The session id assigned to this client run.
    pub session_id: u32,
    /// The program id this session was bound to.
    pub program_id: u32,
    /// Whether a CLR index is already cached for this program.
    pub has_remote_clr: bool,
    /// Whether an aggressive CDS archive is already cached.
    pub has_remote_cds: bool,
    /// Whether an AOT library (static or PGO) is already cached.
    pub has_remote_aot: bool,
}

impl SessionHandshakeReply {
    /// Encodes this reply into a standalone message body.
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = MessageBuffer::new();
        buf.write_u32(self.stream_id);
        buf.write_u64(self.server_random_id);
        buf.write_u32(self.session_id);
        buf.write_u32(self.program_id);
        buf.write_bool(self.has_remote_clr);
        buf.write_bool(self.has_remote_cds);
        buf.write_bool(self.has_remote_aot);
        buf.into_bytes()
    }

    /// Decodes a reply body produced by [`Self::encode_to_vec`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the body is truncated.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut buf = MessageBuffer::from_bytes(body.to_vec());
        Ok(Self {
            stream_id: buf.read_u32()?,
            server_random_id: buf.read_u64()?,
            session_id: buf.read_u32()?,
            program_id: buf.read_u32()?,
            has_remote_clr: buf.read_bool()?,
            has_remote_cds: buf.read_bool()?,
            has_remote_aot: buf.read_bool()?,
        })
    }
}

/// Body of a `ClientStreamMeta` request: `{session_id, client_random_id,
/// server_random_id}` (SPEC_FULL.md §4.2, §4.7), opening a subsequent stream
/// against an already-established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandshakeRequest {
    /// The session this stream claims to belong to.
    pub session_id: u32,
    /// Must match the session's `client_random_id`.
    pub client_random_id: u64,
    /// Must match the session's `server_random_id`.
    pub server_random_id: u64,
}

impl StreamHandshakeRequest {
    /// Encodes this request into a standalone message body.
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = MessageBuffer::new();
        buf.write_u32(self.session_id);
        buf.write_u64(self.client_random_id);
        buf.write_u64(self.server_random_id);
        buf.into_bytes()
    }

    /// Decodes a request body produced by [`Self::encode_to_vec`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the body is truncated.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut buf = MessageBuffer::from_bytes(body.to_vec());
        Ok(Self {
            session_id: buf.read_u32()?,
            client_random_id: buf.read_u64()?,
            server_random_id: buf.read_u64()?,
        })
    }
}

/// Reply to a `ClientStreamMeta` request, carried on the same `MessageType`:
/// `{stream_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandshakeReply {
    /// The stream id assigned to this stream.
    pub stream_id: u32,
}

impl StreamHandshakeReply {
    /// Encodes this reply into a standalone message body.
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = MessageBuffer::new();
        buf.write_u32(self.stream_id);
        buf.into_bytes()
    }

    /// Decodes a reply body produced by [`Self::encode_to_vec`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the body is truncated.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut buf = MessageBuffer::from_bytes(body.to_vec());
        Ok(Self { stream_id: buf.read_u32()? })
    }
}

/// `{magic: i32}` echo, sent in both directions on a `ClientDaemonTask`
/// stream (SPEC_FULL.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    /// Arbitrary echoed value; only used to detect a dead peer via timeout.
    pub magic: i32,
}

impl HeartbeatPayload {
    /// Encodes this payload into a standalone message body.
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = MessageBuffer::new();
        buf.write_u32(self.magic as u32);
        buf.into_bytes()
    }

    /// Decodes a payload produced by [`Self::encode_to_vec`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the body is truncated.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut buf = MessageBuffer::from_bytes(body.to_vec());
        Ok(Self { magic: buf.read_u32()? as i32 })
    }
}

/// `{reason: string}` — the body of an `UnsupportedClient` rejection
/// (SPEC_FULL.md §4.7), sent immediately before the server closes the
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedClientPayload {
    /// Human-readable rejection reason.
    pub reason: String,
}

impl UnsupportedClientPayload {
    /// Encodes this payload into a standalone message body.
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = MessageBuffer::new();
        write_required_string(&mut buf, &self.reason);
        buf.into_bytes()
    }

    /// Decodes a payload produced by [`Self::encode_to_vec`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the body is truncated or not valid
    /// UTF-8.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut buf = MessageBuffer::from_bytes(body.to_vec());
        Ok(Self { reason: read_required_string(&mut buf, "reason")? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CpuArch;

    fn sample_identity() -> ProgramIdentity {
        ProgramIdentity {
            cpu_arch: CpuArch::Aarch64,
            runtime_version: 17_000_700,
            runtime_build_info: "bishengjdk-17+7".to_string(),
            program_name: "HelloWorld".to_string(),
            program_entry: "HelloWorld".to_string(),
            is_jar: true,
            classpath_names_hash: 0x1234_5678,
            classpath_mtimes_hash: 0x0bad_f00d,
            agent_names_hash: 0,
            strict_command_line: Some("java -jar app.jar".to_string()),
            boost_flags: BoostFlags { clr: true, cds: true, aot: true, pgo: false },
            runtime_flags: RuntimeFlagSnapshot::new([("UseG1GC".to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn program_identity_round_trips() {
        let mut buf = MessageBuffer::new();
        sample_identity().encode(&mut buf);
        assert_eq!(ProgramIdentity::decode(&mut buf).unwrap(), sample_identity());
    }

    #[test]
    fn program_identity_round_trips_without_strict_command_line() {
        let mut identity = sample_identity();
        identity.strict_command_line = None;
        let mut buf = MessageBuffer::new();
        identity.encode(&mut buf);
        assert_eq!(ProgramIdentity::decode(&mut buf).unwrap(), identity);
    }

    #[test]
    fn session_handshake_request_round_trips() {
        let req = SessionHandshakeRequest {
            magic: 0xB005_7AC0,
            client_random_id: 0x1122_3344_5566_7788,
            program_identity: sample_identity(),
        };
        let bytes = req.encode_to_vec();
        assert_eq!(SessionHandshakeRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn session_handshake_reply_round_trips() {
        let reply = SessionHandshakeReply {
            stream_id: 1,
            server_random_id: 0xCAFE_BABE,
            session_id: 7,
            program_id: 3,
            has_remote_clr: true,
            has_remote_cds: false,
            has_remote_aot: true,
        };
        let bytes = reply.encode_to_vec();
        assert_eq!(SessionHandshakeReply::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn stream_handshake_round_trips() {
        let req = StreamHandshakeRequest { session_id: 4, client_random_id: 9, server_random_id: 10 };
        assert_eq!(StreamHandshakeRequest::decode(&req.encode_to_vec()).unwrap(), req);

        let reply = StreamHandshakeReply { stream_id: 5 };
        assert_eq!(StreamHandshakeReply::decode(&reply.encode_to_vec()).unwrap(), reply);
    }

    #[test]
    fn heartbeat_payload_round_trips_negative_magic() {
        let hb = HeartbeatPayload { magic: -1 };
        assert_eq!(HeartbeatPayload::decode(&hb.encode_to_vec()).unwrap(), hb);
    }

    #[test]
    fn unsupported_client_payload_round_trips() {
        let payload = UnsupportedClientPayload { reason: "cpu-arch mismatch".to_string() };
        assert_eq!(UnsupportedClientPayload::decode(&payload.encode_to_vec()).unwrap(), payload);
    }
}
