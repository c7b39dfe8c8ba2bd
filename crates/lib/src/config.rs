//! Configuration for mirrors and their connections.
//!
//! Both structs deserialize from partial input; every missing field takes its
//! default.
//!
//! ```
//! use scopesync::config::MirrorConfig;
//!
//! let config: MirrorConfig = serde_json::from_str(r#"{"release_delay_ms": 0}"#).unwrap();
//! assert!(config.release_delay().is_zero());
//! assert_eq!(config.identity.store_id_len, 44);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default delay between the last release of a connection and its teardown.
pub const DEFAULT_RELEASE_DELAY_MS: u64 = 500;

/// Settings shared by every connection created from one registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Milliseconds to wait after the reference count reaches zero before the
    /// connection is torn down. A re-acquire within this window reuses the live
    /// subscription. Zero tears down as soon as the last handle drops.
    pub release_delay_ms: u64,

    /// How subjects are minted for locally created entities.
    pub identity: IdentityConfig,
}

impl MirrorConfig {
    pub fn release_delay(&self) -> Duration {
        Duration::from_millis(self.release_delay_ms)
    }

    /// A config that tears connections down immediately on release.
    pub fn immediate_release() -> Self {
        Self {
            release_delay_ms: 0,
            ..Default::default()
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            release_delay_ms: DEFAULT_RELEASE_DELAY_MS,
            identity: IdentityConfig::default(),
        }
    }
}

/// Shape of generated subjects: `{namespace}{subject_marker}{random}`.
///
/// The namespace is the store locator of the enclosing graph when that graph
/// starts with `store_prefix`, and `fallback_namespace` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub store_prefix: String,
    /// Length of the store id that follows `store_prefix`.
    pub store_id_len: usize,
    pub fallback_namespace: String,
    /// Number of random bytes, encoded as unpadded base64url.
    pub random_bytes: usize,
    pub subject_marker: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            store_prefix: "did:ng:o:".to_string(),
            store_id_len: 44,
            fallback_namespace: "did:ng:o:local".to_string(),
            random_bytes: 33,
            subject_marker: ":q:".to_string(),
        }
    }
}
