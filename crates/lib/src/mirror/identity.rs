//! Subject generation for locally created entities.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{Rng, rngs::OsRng};

use crate::{config::IdentityConfig, model::Identity};

/// Mints subjects for entities created locally without one.
///
/// Implementations must be usable from any thread; a mirror holds its generator
/// behind an `Arc` and calls it while an edit is in progress.
pub trait IdentityGenerator: Send + Sync {
    /// Returns a fresh subject for an entity in `graph`, nested under `parent`
    /// when it is not a root member.
    fn subject(&self, graph: &str, parent: Option<&Identity>) -> String;
}

/// Generates `{namespace}:q:{random}` subjects from the operating system RNG.
#[derive(Debug, Clone, Default)]
pub struct RandomIdentityGenerator {
    config: IdentityConfig,
}

impl RandomIdentityGenerator {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    /// The store locator at the start of `graph`, if it has the store shape.
    fn store_locator<'a>(&self, graph: &'a str) -> Option<&'a str> {
        if !graph.starts_with(&self.config.store_prefix) {
            return None;
        }
        let len = self.config.store_prefix.len() + self.config.store_id_len;
        Some(graph.get(..len).unwrap_or(graph))
    }

    fn random_suffix(&self) -> String {
        let mut bytes = vec![0u8; self.config.random_bytes];
        OsRng.fill(&mut bytes[..]);
        Base64UrlUnpadded::encode_string(&bytes)
    }
}

impl IdentityGenerator for RandomIdentityGenerator {
    fn subject(&self, graph: &str, parent: Option<&Identity>) -> String {
        let namespace = parent
            .and_then(|parent| parent.graph.as_deref())
            .and_then(|graph| self.store_locator(graph))
            .or_else(|| self.store_locator(graph))
            .unwrap_or(self.config.fallback_namespace.as_str());
        format!(
            "{namespace}{}{}",
            self.config.subject_marker,
            self.random_suffix()
        )
    }
}
