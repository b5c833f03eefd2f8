//! Capability flags on services and pragma directives on operations.

use bitflags::bitflags;

bitflags! {
    /// Capability set of a stateful service. Flags combine freely.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServiceOptions: u32 {
        /// Every accepted mutation is appended to the document store.
        const PERSISTENCE = 1 << 0;
        /// Accepted mutations are fanned out to the replication layer.
        const REPLICATION = 1 << 1;
        /// Replication acceptance (quorum) is awaited before completion.
        const OWNER_SELECTION = 1 << 2;
        /// A create against an existing child is converted into an update.
        const IDEMPOTENT_CREATE = 1 << 3;
        /// Updates must carry the current version.
        const STRICT_UPDATE_CHECKING = 1 << 4;
        /// Overlapping in-flight operations instead of strict serialization.
        const CONCURRENT_UPDATE_HANDLING = 1 << 5;
        /// Per-action counters and latency samples.
        const INSTRUMENTATION = 1 << 6;
    }
}

impl ServiceOptions {
    /// Flag names in declaration order, for capability reports.
    #[must_use]
    pub fn names(self) -> Vec<String> {
        self.iter_names().map(|(name, _)| name.to_string()).collect()
    }
}

/// Wire name of [`Pragmas::NO_INDEX_UPDATE`].
pub const PRAGMA_NO_INDEX_UPDATE: &str = "no-index-update";
/// Wire name of [`Pragmas::VERSION_CHECK`].
pub const PRAGMA_VERSION_CHECK: &str = "version-check";

bitflags! {
    /// Out-of-band directives altering persistence or versioning behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Pragmas: u8 {
        /// DELETE stops the instance without touching the store.
        const NO_INDEX_UPDATE = 1 << 0;
        /// Recreate must declare a version above the last deleted one.
        const VERSION_CHECK = 1 << 1;
    }
}

impl Pragmas {
    /// Parses a comma-separated pragma header value.
    ///
    /// Directives the core does not know are opaque and ignored.
    #[must_use]
    pub fn parse_header(value: &str) -> Self {
        value
            .split(',')
            .map(str::trim)
            .fold(Self::empty(), |acc, directive| {
                match directive.to_ascii_lowercase().as_str() {
                    PRAGMA_NO_INDEX_UPDATE => acc | Self::NO_INDEX_UPDATE,
                    PRAGMA_VERSION_CHECK => acc | Self::VERSION_CHECK,
                    _ => acc,
                }
            })
    }

    /// Formats the set as a pragma header value.
    #[must_use]
    pub fn to_header(self) -> String {
        let mut directives = Vec::new();
        if self.contains(Self::NO_INDEX_UPDATE) {
            directives.push(PRAGMA_NO_INDEX_UPDATE);
        }
        if self.contains(Self::VERSION_CHECK) {
            directives.push(PRAGMA_VERSION_CHECK);
        }
        directives.join(", ")
    }
}
