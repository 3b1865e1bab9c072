//! Protection level configuration.
//!
//! The default level is read from the `SENTINEL_PROTECTION` environment
//! variable:
//! - `full` (default): canaries and checksums.
//! - `canary`: the four sentinels only.
//! - `hash`: the two checksums only.
//! - `off`: structural checks only. Baseline for benchmarking.
//!
//! [`StackBuilder::protection`](crate::StackBuilder::protection) overrides it
//! per stack.

use std::sync::OnceLock;

use serde::Serialize;

/// Environment variable holding the default protection level.
pub const PROTECTION_ENV: &str = "SENTINEL_PROTECTION";

/// Which guards a stack runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    /// Structural checks only.
    Off,
    /// Structure and data sentinels.
    CanaryOnly,
    /// Structure and data checksums.
    HashOnly,
    /// Sentinels and checksums.
    #[default]
    Full,
}

impl Protection {
    /// Every level, weakest first.
    pub const ALL: [Self; 4] = [Self::Off, Self::CanaryOnly, Self::HashOnly, Self::Full];

    /// Parse from string (case-insensitive). Unknown values mean `Full`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" => Self::Off,
            "canary" | "canaries" | "canary-only" => Self::CanaryOnly,
            "hash" | "hashes" | "checksum" | "hash-only" => Self::HashOnly,
            _ => Self::Full,
        }
    }

    #[must_use]
    pub const fn canaries(self) -> bool {
        matches!(self, Self::CanaryOnly | Self::Full)
    }

    #[must_use]
    pub const fn hashes(self) -> bool {
        matches!(self, Self::HashOnly | Self::Full)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::CanaryOnly => "canary",
            Self::HashOnly => "hash",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static GLOBAL_PROTECTION: OnceLock<Protection> = OnceLock::new();

/// Configured default level (reads the env var on first call, caches thereafter).
#[must_use]
pub fn protection() -> Protection {
    *GLOBAL_PROTECTION.get_or_init(|| {
        std::env::var(PROTECTION_ENV)
            .map(|v| Protection::from_str_loose(&v))
            .unwrap_or_default()
    })
}
