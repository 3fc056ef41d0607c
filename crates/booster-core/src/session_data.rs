//! `SessionData`: one per client run (SPEC_FULL.md §3, §4.3).
//!
//! No teacher counterpart; grounded on the spec text, reusing
//! [`crate::program_data::RefCount`] for the same ref-count-with-timestamp
//! discipline `ProgramData` uses.

use std::sync::Arc;

use dashmap::DashMap;

use crate::program_data::{ProgramData, RefCount};

/// A concurrent mapping from a remote (client-side) opaque address to a
/// local (server-side) pointer, used to rehydrate object-graph identity
/// across the wire without re-transmitting it (SPEC_FULL.md §3
/// "AddressMap", §9 "Cross-process pointer identity": addresses travel as
/// `u64` wire values, looked up as `HashMap<u64, Arc<T>>` on the server).
#[derive(Debug, Default)]
pub struct AddressMap<T> {
    entries: DashMap<u64, Arc<T>>,
}

impl<T> AddressMap<T> {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Looks up the server-side value for a client-side address.
    #[must_use]
    pub fn get(&self, client_address: u64) -> Option<Arc<T>> {
        self.entries.get(&client_address).map(|entry| Arc::clone(&entry))
    }

    /// Records the server-side value rehydrated for a client-side address.
    /// Overwrites any prior mapping for the same address.
    pub fn insert(&self, client_address: u64, value: Arc<T>) {
        self.entries.insert(client_address, value);
    }

    /// Number of addresses currently mapped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Marker type for a reconstructed `InstanceKlass` identity on the server.
/// Opaque beyond its address-map presence — klass internals are an external
/// collaborator's concern (SPEC_FULL.md §1).
#[derive(Debug)]
pub struct KlassHandle(pub u64);

/// Marker type for a method-data blob's server-side identity.
#[derive(Debug)]
pub struct MethodDataHandle(pub u64);

/// Marker type for a reconstructed `ClassLoaderData*` identity on the
/// server, distinct from [`crate::program_data::ClassLoaderHandle`] (which
/// identifies the loader within its owning `ProgramData`) — this one is the
/// per-session wire address translation target.
#[derive(Debug)]
pub struct ClassLoaderDataHandle(pub u64);

/// One client run's session record (SPEC_FULL.md §3).
#[derive(Debug)]
pub struct SessionData {
    session_id: u32,
    client_random_id: u64,
    server_random_id: u64,
    program_data: Arc<ProgramData>,
    class_loader_addresses: AddressMap<ClassLoaderDataHandle>,
    klass_addresses: AddressMap<KlassHandle>,
    method_addresses: AddressMap<MethodDataHandle>,
    ref_count: RefCount,
}

impl SessionData {
    /// Creates a fresh session bound to `program_data`.
    ///
    /// The caller is responsible for having already incremented
    /// `program_data`'s ref-count on this session's behalf (per
    /// `ServerDataManager::get_or_create`'s contract).
    #[must_use]
    pub fn new(
        session_id: u32,
        client_random_id: u64,
        server_random_id: u64,
        program_data: Arc<ProgramData>,
    ) -> Self {
        Self {
            session_id,
            client_random_id,
            server_random_id,
            program_data,
            class_loader_addresses: AddressMap::new(),
            klass_addresses: AddressMap::new(),
            method_addresses: AddressMap::new(),
            ref_count: RefCount::new(),
        }
    }

    /// The server-assigned session id.
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// The client-chosen random id, used to detect stale reconnects after a
    /// server restart (SPEC_FULL.md §3, §8 "Stale reconnect").
    #[must_use]
    pub fn client_random_id(&self) -> u64 {
        self.client_random_id
    }

    /// The server-chosen random id handed back at handshake time, echoed by
    /// the client on subsequent streams.
    #[must_use]
    pub fn server_random_id(&self) -> u64 {
        self.server_random_id
    }

    /// Whether `(client_random_id, server_random_id)` matches what this
    /// session was created with — the check driving `ClientStreamMeta`
    /// acceptance (SPEC_FULL.md §4.2).
    #[must_use]
    pub fn matches_stream_meta(&self, client_random_id: u64, server_random_id: u64) -> bool {
        self.client_random_id == client_random_id && self.server_random_id == server_random_id
    }

    /// The shared program record this session belongs to.
    #[must_use]
    pub fn program_data(&self) -> &Arc<ProgramData> {
        &self.program_data
    }

    /// The client↔server class-loader address table.
    #[must_use]
    pub fn class_loader_addresses(&self) -> &AddressMap<ClassLoaderDataHandle> {
        &self.class_loader_addresses
    }

    /// The client→server klass address table.
    #[must_use]
    pub fn klass_addresses(&self) -> &AddressMap<KlassHandle> {
        &self.klass_addresses
    }

    /// The method→method-data address table.
    #[must_use]
    pub fn method_addresses(&self) -> &AddressMap<MethodDataHandle> {
        &self.method_addresses
    }

    /// This session's own ref-count (held by its live streams).
    #[must_use]
    pub fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{BoostFlags, CpuArch, ProgramIdentity, RuntimeFlagSnapshot};

    fn program_data() -> Arc<ProgramData> {
        let dir = tempfile::tempdir().unwrap();
        let identity = ProgramIdentity {
            cpu_arch: CpuArch::X86,
            runtime_version: 1,
            runtime_build_info: String::new(),
            program_name: "p".to_string(),
            program_entry: "p".to_string(),
            is_jar: false,
            classpath_names_hash: 0,
            classpath_mtimes_hash: 0,
            agent_names_hash: 0,
            strict_command_line: None,
            boost_flags: BoostFlags::default(),
            runtime_flags: RuntimeFlagSnapshot::default(),
        };
        Arc::new(ProgramData::new(1, identity, dir.path()))
    }

    #[test]
    fn stream_meta_match_requires_both_randoms() {
        let session = SessionData::new(1, 0xAA, 0xBB, program_data());
        assert!(session.matches_stream_meta(0xAA, 0xBB));
        assert!(!session.matches_stream_meta(0xAA, 0xCC));
        assert!(!session.matches_stream_meta(0x11, 0xBB));
    }

    #[test]
    fn address_map_round_trips_client_address_to_handle() {
        let map: AddressMap<KlassHandle> = AddressMap::new();
        assert!(map.is_empty());
        map.insert(7, Arc::new(KlassHandle(700)));
        assert_eq!(map.get(7).unwrap().0, 700);
        assert_eq!(map.len(), 1);
        assert!(map.get(8).is_none());
    }
}
