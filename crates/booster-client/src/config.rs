//! Client-side configuration (SPEC_FULL.md §6 "Flag surface").
//!
//! This crate does not parse environment/CLI flags itself (SPEC_FULL.md §6:
//! "the crate does not parse... flags on the client side itself") — the
//! embedding runtime owns flag parsing and constructs [`ClientConfig`]
//! directly.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::boost::{BoostPolicy, StopAtLevel};

/// Configuration an embedding runtime builds to drive this crate
/// (SPEC_FULL.md §6).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `UseBooster`: master on/off switch for the boost path.
    pub use_booster: bool,
    /// `BoosterAddress`/`BoosterPort`, combined into one endpoint.
    pub server_address: SocketAddr,
    /// `BoosterTimeout`: per-operation socket timeout.
    pub timeout: Duration,
    /// `BoosterCachePath`: defaults to [`Self::default_cache_dir`].
    pub cache_dir: PathBuf,
    /// `BoosterLocalMode`: skip the server, use only what's on the local
    /// filesystem.
    pub local_mode: bool,
    /// `BoostStopAtLevel` / `UseBoostPackages`, already resolved to one
    /// policy by the embedder (the two flags are mutually exclusive).
    pub boost_policy: BoostPolicy,
    /// `BoosterClientStrictMatch`: fold the full command line into program
    /// identity.
    pub strict_match: bool,
    /// `BoosterCrashIfNoServer`: exit rather than escape when the handshake
    /// fails.
    pub crash_if_no_server: bool,
    /// `BoosterExitIfUnsupported`: exit when the server sends
    /// `UnsupportedClient`.
    pub exit_if_unsupported: bool,
    /// `BoosterResolveExtraKlasses`: drives compiler extra-resolution mode.
    /// Not otherwise interpreted by this crate — the locator/data-exchange
    /// round trip it affects is out of scope (SPEC_FULL.md §1).
    pub resolve_extra_klasses: bool,
    /// `BoosterStartupMaxTime`: plan-B timeout; `None` means off (`0`).
    pub startup_max_time: Option<Duration>,
}

impl ClientConfig {
    /// This crate's default `BoosterCachePath`: `$HOME/.booster/client`
    /// (SPEC_FULL.md §6 notes the original defaults to
    /// `$HOME/.jbooster/client`).
    #[must_use]
    pub fn default_cache_dir() -> PathBuf {
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
        home.join(".booster").join("client")
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            use_booster: true,
            server_address: SocketAddr::from(([127, 0, 0, 1], 7420)),
            timeout: crate::transport::DEFAULT_TIMEOUT,
            cache_dir: Self::default_cache_dir(),
            local_mode: false,
            boost_policy: BoostPolicy::StopAtLevel(StopAtLevel::Pgo),
            strict_match: false,
            crash_if_no_server: false,
            exit_if_unsupported: false,
            resolve_extra_klasses: false,
            startup_max_time: None,
        }
    }
}
