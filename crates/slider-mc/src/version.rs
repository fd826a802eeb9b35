//! Protocol version definitions.
//!
//! This module provides the [`ProtocolVersion`] enum for identifying
//! which Minecraft protocol version a connection speaks.

/// Minecraft protocol version.
///
/// Each variant represents a specific protocol version number.
/// Variants are feature-gated to allow compile-time selection of
/// supported versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ProtocolVersion {
    /// Protocol version 772 (Minecraft 1.21.7/1.21.8)
    #[cfg(feature = "protocol-772")]
    V772,
}

impl ProtocolVersion {
    /// The version used when the proxy itself opens a connection.
    #[cfg(feature = "protocol-772")]
    pub const LATEST: Self = Self::V772;

    /// Attempt to create a `ProtocolVersion` from a raw protocol version number.
    ///
    /// Returns `None` if the version is not supported or not enabled via features.
    #[must_use]
    pub const fn from_raw(version: i32) -> Option<Self> {
        match version {
            #[cfg(feature = "protocol-772")]
            772 => Some(Self::V772),

            _ => None,
        }
    }

    /// Get the raw protocol version number.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            #[cfg(feature = "protocol-772")]
            Self::V772 => 772,
        }
    }

    /// Gets a list of human-readable version names (e.g., `["1.21.8", "1.21.7"]`).
    #[must_use]
    pub const fn names(self) -> &'static [&'static str] {
        match self {
            #[cfg(feature = "protocol-772")]
            Self::V772 => &["1.21.8", "1.21.7"],
        }
    }

    /// Gets the primary version name (e.g., "1.21.8").
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.names()[0]
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "protocol-772")]
    fn test_v772() {
        let version = ProtocolVersion::from_raw(772).unwrap();
        assert_eq!(version, ProtocolVersion::V772);
        assert_eq!(version.as_raw(), 772);
        assert_eq!(version.names(), &["1.21.8", "1.21.7"]);
        assert_eq!(version.name(), "1.21.8");
        assert_eq!(version.to_string(), "1.21.8 (772)");
    }

    #[test]
    fn test_unknown_version() {
        assert!(ProtocolVersion::from_raw(999).is_none());
        assert!(ProtocolVersion::from_raw(773).is_none());
    }
}
