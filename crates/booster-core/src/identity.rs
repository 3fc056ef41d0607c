//! Program identity: the equality key matching a client to cached artifacts.
//!
//! Grounded on SPEC_FULL.md §3 "ProgramIdentity". No counterpart exists in
//! the teacher repo (its `RoomId`/`DeviceId` model a chat room, not a
//! program's boost-eligibility); this module is new code written in the
//! teacher's idiom — plain structs, `Eq`/`Hash` derived where content
//! equality suffices, explicit hashing only where the wire format demands a
//! stable 32-bit fold rather than `std::hash::Hash`'s unspecified output.

use std::fmt;

/// CPU architecture tag contributing to program identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuArch {
    /// Architecture could not be determined.
    Unknown,
    /// 32/64-bit x86.
    X86,
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM.
    Aarch64,
}

impl CpuArch {
    fn tag(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::X86 => 1,
            Self::Arm => 2,
            Self::Aarch64 => 3,
        }
    }

    /// The single-byte wire tag (SPEC_FULL.md §3, used by `crate::wire`).
    #[must_use]
    pub fn to_wire(self) -> u8 {
        self.tag() as u8
    }

    /// Recovers a `CpuArch` from its wire tag; unrecognised values decode to
    /// `Unknown` rather than erroring, matching how an unexpected
    /// architecture tag should degrade rather than kill the handshake.
    #[must_use]
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => Self::X86,
            2 => Self::Arm,
            3 => Self::Aarch64,
            _ => Self::Unknown,
        }
    }
}

/// The four independently toggleable boost packages (SPEC_FULL.md §6,
/// `BoostStopAtLevel`/`UseBoostPackages`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BoostFlags {
    /// Class-loader resource index enabled.
    pub clr: bool,
    /// Shared class archive enabled.
    pub cds: bool,
    /// AOT native library enabled.
    pub aot: bool,
    /// Profile-guided AOT enabled (requires `aot`).
    pub pgo: bool,
}

/// A stable snapshot of the fixed, enumerated set of runtime flags that
/// participate in program identity (SPEC_FULL.md §3, §6).
///
/// Stored as sorted `(name, value)` pairs so two snapshots built in
/// different flag-registration order still compare and hash identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RuntimeFlagSnapshot {
    flags: Vec<(String, String)>,
}

impl RuntimeFlagSnapshot {
    /// Builds a snapshot from an arbitrary iterator of flag name/value
    /// pairs, normalizing to sorted order.
    #[must_use]
    pub fn new(flags: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut flags: Vec<(String, String)> = flags.into_iter().collect();
        flags.sort();
        flags.dedup_by(|a, b| a.0 == b.0);
        Self { flags }
    }

    /// The sorted flag pairs.
    #[must_use]
    pub fn as_slice(&self) -> &[(String, String)] {
        &self.flags
    }
}

/// The equality key identifying a program (SPEC_FULL.md §3).
///
/// Equality requires an exact match on every field; [`ProgramIdentity::hash_fold`]
/// produces the stable 32-bit hash transmitted and used as a map-sharding
/// hint (actual map lookups use full `Eq`, the hash is advisory/wire-level
/// only, matching the spec's "identity hash `H`" language in §8 scenario 1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramIdentity {
    /// CPU architecture tag.
    pub cpu_arch: CpuArch,
    /// Runtime version, as a single comparable integer.
    pub runtime_version: u64,
    /// Runtime build-info string (e.g. vendor/build identifier).
    pub runtime_build_info: String,
    /// Program display name.
    pub program_name: String,
    /// Program entry point: main-class or jar name, jar suffix stripped.
    pub program_entry: String,
    /// Whether `program_entry` names a jar (vs. a main class).
    pub is_jar: bool,
    /// 32-bit hash of the classpath entry *names*.
    pub classpath_names_hash: u32,
    /// 32-bit hash of the classpath entry *mtimes*.
    pub classpath_mtimes_hash: u32,
    /// 32-bit hash of the agent names.
    pub agent_names_hash: u32,
    /// Full command line, present only under `BoosterClientStrictMatch`.
    pub strict_command_line: Option<String>,
    /// Which boost packages this client has enabled.
    pub boost_flags: BoostFlags,
    /// Snapshot of the fixed runtime-flag set.
    pub runtime_flags: RuntimeFlagSnapshot,
}

impl ProgramIdentity {
    /// Folds every field into a single stable 32-bit hash (SPEC_FULL.md §3,
    /// "the hash is a fold of the per-field hashes").
    ///
    /// Uses FNV-1a: simple, dependency-free, and stable across process
    /// restarts and compilers, addressing the brittleness the spec's open
    /// question (i) raises about compiler-dependent type-size hashing.
    #[must_use]
    pub fn hash_fold(&self) -> u32 {
        let mut h = fnv1a32_init();
        h = fnv1a32_mix(h, &self.cpu_arch.tag().to_le_bytes());
        h = fnv1a32_mix(h, &self.runtime_version.to_le_bytes());
        h = fnv1a32_mix(h, self.runtime_build_info.as_bytes());
        h = fnv1a32_mix(h, self.program_name.as_bytes());
        h = fnv1a32_mix(h, self.program_entry.as_bytes());
        h = fnv1a32_mix(h, &[u8::from(self.is_jar)]);
        h = fnv1a32_mix(h, &self.classpath_names_hash.to_le_bytes());
        h = fnv1a32_mix(h, &self.classpath_mtimes_hash.to_le_bytes());
        h = fnv1a32_mix(h, &self.agent_names_hash.to_le_bytes());
        if let Some(cmd) = &self.strict_command_line {
            h = fnv1a32_mix(h, cmd.as_bytes());
        }
        h = fnv1a32_mix(
            h,
            &[
                u8::from(self.boost_flags.clr),
                u8::from(self.boost_flags.cds),
                u8::from(self.boost_flags.aot),
                u8::from(self.boost_flags.pgo),
            ],
        );
        for (name, value) in self.runtime_flags.as_slice() {
            h = fnv1a32_mix(h, name.as_bytes());
            h = fnv1a32_mix(h, value.as_bytes());
        }
        h
    }

    /// The derived human-readable string id used for cache file names
    /// (SPEC_FULL.md §3 `ProgramData`, §6 "Persisted state layout":
    /// `<name>-<entry>-<hash-hex>`).
    #[must_use]
    pub fn derived_string_id(&self) -> String {
        format!("{}-{}-{:08x}", self.program_name, self.program_entry, self.hash_fold())
    }
}

impl fmt::Display for ProgramIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.derived_string_id())
    }
}

fn fnv1a32_init() -> u32 {
    0x811c_9dc5
}

fn fnv1a32_mix(mut hash: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProgramIdentity {
        ProgramIdentity {
            cpu_arch: CpuArch::Aarch64,
            runtime_version: 17_000_700,
            runtime_build_info: "bishengjdk-17+7".to_string(),
            program_name: "HelloWorld".to_string(),
            program_entry: "HelloWorld".to_string(),
            is_jar: false,
            classpath_names_hash: 0x1234_5678,
            classpath_mtimes_hash: 0x0bad_f00d,
            agent_names_hash: 0,
            strict_command_line: None,
            boost_flags: BoostFlags { clr: true, cds: true, aot: true, pgo: false },
            runtime_flags: RuntimeFlagSnapshot::new([("UseG1GC".to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn identical_identities_hash_identically() {
        assert_eq!(sample().hash_fold(), sample().hash_fold());
    }

    #[test]
    fn differing_field_changes_hash() {
        let mut other = sample();
        other.runtime_version += 1;
        assert_ne!(sample().hash_fold(), other.hash_fold());
    }

    #[test]
    fn strict_command_line_participates_in_identity() {
        let mut with_cmd = sample();
        with_cmd.strict_command_line = Some("java -jar app.jar".to_string());
        assert_ne!(sample(), with_cmd);
        assert_ne!(sample().hash_fold(), with_cmd.hash_fold());
    }

    #[test]
    fn flag_snapshot_is_order_independent() {
        let a = RuntimeFlagSnapshot::new([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "2".to_string()),
        ]);
        let b = RuntimeFlagSnapshot::new([
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "1".to_string()),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn derived_string_id_matches_cache_file_naming_convention() {
        let id = sample();
        let derived = id.derived_string_id();
        assert!(derived.starts_with("HelloWorld-HelloWorld-"));
        assert_eq!(derived.len(), "HelloWorld-HelloWorld-".len() + 8);
    }
}
