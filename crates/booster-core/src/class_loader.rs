//! Class-loader identity and parent-chain reconstruction.
//!
//! Grounded on SPEC_FULL.md §3 "ClassLoaderKey"/"ClassLoaderChain" and §4.3's
//! resolution rule. No teacher counterpart exists; the interning scheme
//! below is new code, shaped like the teacher's preference for `Arc`-based
//! sharing (see `lockframe-core::env`'s use of `Arc` for shared state) rather
//! than owned `String` duplication.

use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use dashmap::DashSet;

/// Interns strings so that [`ClassLoaderKey`] equality can be pointer
/// equality, per SPEC_FULL.md §3: "Equality is pointer-equality of interned
/// symbols." One interner is shared per `ProgramData` — class-loader
/// identifiers are only ever compared within the scope of a single program.
#[derive(Debug, Default)]
pub struct Interner {
    symbols: DashSet<Arc<str>>,
}

impl Interner {
    /// Creates an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical `Arc<str>` for `value`, interning it if this is
    /// the first time it has been seen.
    #[must_use]
    pub fn intern(&self, value: &str) -> Arc<str> {
        if let Some(existing) = self.symbols.get(value) {
            return existing.clone();
        }
        let fresh: Arc<str> = Arc::from(value);
        self.symbols.insert(Arc::clone(&fresh));
        fresh
    }
}

/// An interned, optional string: `None` represents the spec's `⊥` (bottom).
pub type InternedOpt = Option<Arc<str>>;

/// Pointer-equal wrapper comparing by `Arc` identity rather than content.
///
/// Two `PtrEq` values are equal iff they wrap the same allocation (or are
/// both `None`), matching the spec's class-loader-key equality rule. This
/// deliberately diverges from `Arc<str>`'s `PartialEq`, which compares
/// content — re-interning identical text through the same [`Interner`]
/// always yields the same allocation, so content and pointer equality agree
/// in practice, but the explicit wrapper keeps that invariant enforced by
/// the type rather than by caller discipline.
#[derive(Debug, Clone)]
struct PtrEq(InternedOpt);

impl PartialEq for PtrEq {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for PtrEq {}

impl Hash for PtrEq {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Some(s) => (Arc::as_ptr(s).cast::<()>()).hash(state),
            None => 0usize.hash(state),
        }
    }
}

/// Triple of interned strings identifying a class loader (SPEC_FULL.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassLoaderKey {
    loader_class_name: PtrEq,
    loader_name: PtrEq,
    first_loaded_class_name: PtrEq,
}

impl ClassLoaderKey {
    /// Builds a key from already-interned fields.
    #[must_use]
    pub fn new(
        loader_class_name: InternedOpt,
        loader_name: InternedOpt,
        first_loaded_class_name: InternedOpt,
    ) -> Self {
        Self {
            loader_class_name: PtrEq(loader_class_name),
            loader_name: PtrEq(loader_name),
            first_loaded_class_name: PtrEq(first_loaded_class_name),
        }
    }

    /// The well-known boot-loader key: `(⊥, ⊥, ⊥)`.
    #[must_use]
    pub fn boot() -> Self {
        Self::new(None, None, None)
    }

    /// The well-known platform-loader key:
    /// `("…PlatformClassLoader", ⊥, ⊥)`.
    #[must_use]
    pub fn platform(interner: &Interner) -> Self {
        Self::new(Some(interner.intern("…PlatformClassLoader")), None, None)
    }

    /// Whether this key identifies the boot loader.
    #[must_use]
    pub fn is_boot(&self) -> bool {
        self == &Self::boot()
    }

    /// Whether this key identifies the platform loader.
    #[must_use]
    pub fn is_platform(&self, interner: &Interner) -> bool {
        self == &Self::platform(interner)
    }
}

/// One link in a [`ClassLoaderChain`]: a loader's key plus its address on
/// the client, used to rehydrate identity without re-transmitting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassLoaderLink {
    /// The loader's identity key.
    pub key: ClassLoaderKey,
    /// The opaque client-side address for this loader (rehydrated through
    /// the owning `SessionData`'s address map).
    pub client_address: u64,
}

/// The parent path from a target class loader up to the boot loader
/// (SPEC_FULL.md §3). Ordered parent-first: index 0 is nearest the boot
/// loader, the last element is the target loader itself.
///
/// Resolution (§4.3) requires parents to be inserted before children; this
/// ordering is exactly what callers should iterate over to do that.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassLoaderChain {
    links: Vec<ClassLoaderLink>,
}

impl ClassLoaderChain {
    /// Builds a chain from parent-first links. Cycles are forbidden by
    /// contract (§9); this constructor does not itself detect them, callers
    /// assembling a chain from wire data should reject a repeated key.
    #[must_use]
    pub fn from_parent_first(links: Vec<ClassLoaderLink>) -> Self {
        Self { links }
    }

    /// The chain in parent-first order.
    #[must_use]
    pub fn links(&self) -> &[ClassLoaderLink] {
        &self.links
    }

    /// The target (child-most) link, if the chain is non-empty.
    #[must_use]
    pub fn target(&self) -> Option<&ClassLoaderLink> {
        self.links.last()
    }

    /// Whether a key already appears earlier in the chain than `upto`,
    /// i.e. whether inserting `upto` would close a cycle.
    #[must_use]
    pub fn has_cycle_up_to(&self, upto: usize, key: &ClassLoaderKey) -> bool {
        self.links[..upto.min(self.links.len())].iter().any(|link| &link.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_text_yields_pointer_equal_keys() {
        let interner = Interner::new();
        let a = ClassLoaderKey::new(Some(interner.intern("MyLoader")), None, None);
        let b = ClassLoaderKey::new(Some(interner.intern("MyLoader")), None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_interners_do_not_compare_equal() {
        let one = Interner::new();
        let other = Interner::new();
        let a = ClassLoaderKey::new(Some(one.intern("MyLoader")), None, None);
        let b = ClassLoaderKey::new(Some(other.intern("MyLoader")), None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn boot_key_is_all_bottom() {
        let boot = ClassLoaderKey::boot();
        assert!(boot.is_boot());
    }

    #[test]
    fn platform_key_is_well_known() {
        let interner = Interner::new();
        let platform = ClassLoaderKey::platform(&interner);
        assert!(platform.is_platform(&interner));
        assert!(!platform.is_boot());
    }

    #[test]
    fn chain_cycle_detection_finds_repeated_key() {
        let interner = Interner::new();
        let key = ClassLoaderKey::new(Some(interner.intern("Loop")), None, None);
        let chain = ClassLoaderChain::from_parent_first(vec![
            ClassLoaderLink { key: key.clone(), client_address: 1 },
            ClassLoaderLink { key: ClassLoaderKey::boot(), client_address: 2 },
        ]);
        assert!(chain.has_cycle_up_to(2, &key));
        assert!(!chain.has_cycle_up_to(1, &key));
    }

    #[test]
    fn chain_target_is_last_link() {
        let interner = Interner::new();
        let chain = ClassLoaderChain::from_parent_first(vec![
            ClassLoaderLink { key: ClassLoaderKey::boot(), client_address: 0 },
            ClassLoaderLink {
                key: ClassLoaderKey::new(Some(interner.intern("App")), None, None),
                client_address: 7,
            },
        ]);
        assert_eq!(chain.target().unwrap().client_address, 7);
    }
}
