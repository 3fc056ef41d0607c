//! Boost-flag resolution and per-artifact fetch/generate selection
//! (SPEC_FULL.md §4.8, §6 "Flag surface").

use booster_core::BoostFlags;

/// `BoostStopAtLevel`'s five levels (SPEC_FULL.md §6): each level implies
/// every package below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAtLevel {
    /// Level 0: boost disabled entirely.
    None,
    /// Level 1: CLR only.
    Clr,
    /// Level 2: CLR + CDS.
    Cds,
    /// Level 3: CLR + CDS + AOT.
    Aot,
    /// Level 4: CLR + CDS + AOT + PGO.
    Pgo,
}

impl StopAtLevel {
    /// Expands this level into the individual package flags it implies.
    #[must_use]
    pub fn to_flags(self) -> BoostFlags {
        match self {
            Self::None => BoostFlags::default(),
            Self::Clr => BoostFlags { clr: true, ..BoostFlags::default() },
            Self::Cds => BoostFlags { clr: true, cds: true, ..BoostFlags::default() },
            Self::Aot => BoostFlags { clr: true, cds: true, aot: true, ..BoostFlags::default() },
            Self::Pgo => BoostFlags { clr: true, cds: true, aot: true, pgo: true },
        }
    }
}

/// `BoostStopAtLevel` and `UseBoostPackages` are mutually exclusive
/// alternatives for the same decision (SPEC_FULL.md §6); this type holds
/// whichever one the embedder chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostPolicy {
    /// `BoostStopAtLevel=N`.
    StopAtLevel(StopAtLevel),
    /// `UseBoostPackages=<csv>`, already parsed.
    Packages(BoostFlags),
}

impl BoostPolicy {
    /// Resolves this policy into the flat set of enabled packages.
    #[must_use]
    pub fn resolve(self) -> BoostFlags {
        match self {
            Self::StopAtLevel(level) => level.to_flags(),
            Self::Packages(flags) => flags,
        }
    }
}

/// Parses `UseBoostPackages`'s csv syntax (SPEC_FULL.md §6): a
/// comma-separated list of `clr`, `cds`, `aot`, `pgo`, or the single token
/// `all`.
///
/// # Errors
///
/// Returns the offending token if it isn't one of the recognised names.
pub fn parse_use_boost_packages(csv: &str) -> Result<BoostFlags, String> {
    if csv.trim().eq_ignore_ascii_case("all") {
        return Ok(BoostFlags { clr: true, cds: true, aot: true, pgo: true });
    }
    let mut flags = BoostFlags::default();
    for token in csv.split(',') {
        match token.trim() {
            "" => continue,
            "clr" => flags.clr = true,
            "cds" => flags.cds = true,
            "aot" => flags.aot = true,
            "pgo" => flags.pgo = true,
            other => return Err(other.to_string()),
        }
    }
    Ok(flags)
}

/// What to do about one artifact kind, decided by crossing a locally
/// allowed flag with the handshake reply's `has_remote_*` booleans
/// (SPEC_FULL.md §4.8 "the handshake's has_remote_* booleans drive
/// selection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactAction {
    /// Already cached on the server; fetch it.
    Fetch,
    /// Allowed but not yet cached; this run may contribute one (CLR/agg-CDS
    /// at shutdown) or trigger lazy-AOT compilation (AOT).
    Generate,
    /// This boost package is not enabled for this run.
    Disabled,
}

impl ArtifactAction {
    /// Whether this artifact kind is in use at all (fetched or generated).
    #[must_use]
    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Decides the action for one artifact kind.
#[must_use]
pub fn artifact_action(allowed: bool, has_remote: bool) -> ArtifactAction {
    if !allowed {
        ArtifactAction::Disabled
    } else if has_remote {
        ArtifactAction::Fetch
    } else {
        ArtifactAction::Generate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_at_level_implies_lower_packages() {
        let flags = StopAtLevel::Aot.to_flags();
        assert!(flags.clr && flags.cds && flags.aot && !flags.pgo);
    }

    #[test]
    fn stop_at_level_none_disables_everything() {
        assert_eq!(StopAtLevel::None.to_flags(), BoostFlags::default());
    }

    #[test]
    fn parse_all_enables_every_package() {
        let flags = parse_use_boost_packages("all").unwrap();
        assert_eq!(flags, BoostFlags { clr: true, cds: true, aot: true, pgo: true });
    }

    #[test]
    fn parse_csv_subset() {
        let flags = parse_use_boost_packages("clr,aot").unwrap();
        assert_eq!(flags, BoostFlags { clr: true, cds: false, aot: true, pgo: false });
    }

    #[test]
    fn parse_rejects_unknown_token() {
        assert_eq!(parse_use_boost_packages("clr,bogus"), Err("bogus".to_string()));
    }

    #[test]
    fn artifact_action_matrix() {
        assert_eq!(artifact_action(false, true), ArtifactAction::Disabled);
        assert_eq!(artifact_action(true, true), ArtifactAction::Fetch);
        assert_eq!(artifact_action(true, false), ArtifactAction::Generate);
    }
}
