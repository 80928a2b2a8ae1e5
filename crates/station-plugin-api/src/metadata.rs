//! Plugin metadata with StableAbi derives.

use abi_stable::std_types::RString;
use abi_stable::StableAbi;

/// ABI-stable plugin metadata.
///
/// Identifies a step library before any of its steps are registered.
#[repr(C)]
#[derive(Debug, Clone, StableAbi)]
pub struct PluginMetadata {
    /// Unique plugin identifier (e.g., "sample")
    pub plugin_id: RString,

    /// Human-readable plugin name
    pub name: RString,

    /// Plugin version (semver format)
    pub version: RString,

    /// Plugin publisher, matched against the station's trusted publishers
    pub publisher: RString,
}

impl PluginMetadata {
    /// Create new plugin metadata with required fields
    pub fn new(plugin_id: &str, name: &str, version: &str) -> Self {
        Self {
            plugin_id: RString::from(plugin_id),
            name: RString::from(name),
            version: RString::from(version),
            publisher: RString::new(),
        }
    }

    /// Builder method to set the publisher
    pub fn with_publisher(mut self, publisher: &str) -> Self {
        self.publisher = RString::from(publisher);
        self
    }
}

/// Version information for ABI compatibility checking
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, StableAbi)]
pub struct AbiVersion {
    /// Major version - breaking changes
    pub major: u32,
    /// Minor version - backwards-compatible additions
    pub minor: u32,
    /// Patch version - bug fixes
    pub patch: u32,
}

impl AbiVersion {
    /// Current ABI version
    pub const CURRENT: Self = Self {
        major: 0,
        minor: 1,
        patch: 0,
    };

    /// Check if this version is compatible with another
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        // Major version must match, minor must be >= required
        self.major == other.major && self.minor >= other.minor
    }
}

impl std::fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_minor_is_compatible() {
        let plugin = AbiVersion {
            major: 0,
            minor: 2,
            patch: 0,
        };
        assert!(plugin.is_compatible_with(&AbiVersion::CURRENT));
    }

    #[test]
    fn major_mismatch_is_incompatible() {
        let plugin = AbiVersion {
            major: 1,
            minor: 1,
            patch: 0,
        };
        assert!(!plugin.is_compatible_with(&AbiVersion::CURRENT));
        assert_eq!(plugin.to_string(), "1.1.0");
    }
}
