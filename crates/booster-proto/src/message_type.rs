//! The closed `MessageType` enum carried in every frame header.
//!
//! Each variant is given a stable `u16` discriminant so that adding a new
//! type never reshuffles the wire values of existing ones.

/// Identifies the payload shape carried by a [`crate::message::Message`].
///
/// Directionality (client→server, server→client, or both) is documented per
/// variant; see SPEC_FULL.md §4.7 for the full contract table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// `{magic, client_random_id, program_identity}` — establishes a session.
    ClientSessionMeta = 1,
    /// `{session_id, client_random_id, server_random_id}` — opens a subsequent stream.
    ClientStreamMeta = 2,
    /// Forces the client to redo the full session handshake.
    ClientSessionMetaAgain = 3,
    /// Terminates a sub-phase within a stream.
    EndOfCurrentPhase = 4,
    /// Clean-close signal from the client.
    NoMoreRequests = 5,
    /// Transfers a stream to the server's control loop for heartbeat lifetime.
    ClientDaemonTask = 6,
    /// Requests the server pull CLR and agg-CDS files from the client.
    CacheFilesSyncTask = 7,
    /// Requests the server compile the program's AOT artifact.
    LazyAotCompilationTask = 8,
    /// Client asks the server to stream the CLR index cache.
    GetClassLoaderResourceCache = 9,
    /// Client asks the server to stream the aggressive CDS archive.
    GetAggressiveCdsCache = 10,
    /// Client asks the server to stream the lazy-AOT library.
    GetLazyAotCache = 11,
    /// Server asks the client to stream its CLR index cache.
    CacheClassLoaderResource = 12,
    /// Server asks the client to stream its aggressive CDS archive.
    CacheAggressiveCds = 13,
    /// Server asks the client for identifiers of class loaders it knows.
    ClassLoaderLocators = 14,
    /// Server asks the client for the parent chain of specified loaders.
    DataOfClassLoaders = 15,
    /// Server asks the client for class identifiers (name + fingerprint + loader).
    KlassLocators = 16,
    /// Server asks the client to transmit class-file bytes for named classes.
    DataOfKlasses = 17,
    /// Server asks the client for method identifiers in a given class list.
    MethodLocators = 18,
    /// Server asks the client for method-profile blobs for named methods.
    ProfilingInfo = 19,
    /// Server asks the client for array-class closures.
    ArrayKlasses = 20,
    /// A single chunk of a `FileWrapper` exchange.
    FileSegment = 21,
    /// `{magic:int}` echo, sent in both directions.
    Heartbeat = 22,
    /// `{reason:string}` — server rejects the client, followed by stream closure.
    UnsupportedClient = 23,
}

impl MessageType {
    /// All variants, in wire-value order. Useful for exhaustive round-trip tests.
    pub const ALL: &'static [MessageType] = &[
        Self::ClientSessionMeta,
        Self::ClientStreamMeta,
        Self::ClientSessionMetaAgain,
        Self::EndOfCurrentPhase,
        Self::NoMoreRequests,
        Self::ClientDaemonTask,
        Self::CacheFilesSyncTask,
        Self::LazyAotCompilationTask,
        Self::GetClassLoaderResourceCache,
        Self::GetAggressiveCdsCache,
        Self::GetLazyAotCache,
        Self::CacheClassLoaderResource,
        Self::CacheAggressiveCds,
        Self::ClassLoaderLocators,
        Self::DataOfClassLoaders,
        Self::KlassLocators,
        Self::DataOfKlasses,
        Self::MethodLocators,
        Self::ProfilingInfo,
        Self::ArrayKlasses,
        Self::FileSegment,
        Self::Heartbeat,
        Self::UnsupportedClient,
    ];

    /// The wire-level `u16` discriminant.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Recovers a `MessageType` from its wire `u16`, if recognised.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|mt| mt.to_u16() == value)
    }
}

#[cfg(test)]
mod tests {
    use super::MessageType;

    #[test]
    fn every_variant_round_trips_through_its_u16() {
        for mt in MessageType::ALL {
            let wire = mt.to_u16();
            assert_eq!(MessageType::from_u16(wire), Some(*mt));
        }
    }

    #[test]
    fn unknown_discriminant_is_rejected() {
        assert_eq!(MessageType::from_u16(0), None);
        assert_eq!(MessageType::from_u16(9999), None);
    }
}
