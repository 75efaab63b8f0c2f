//! Content digests for staleness detection and parameter fingerprints.
//!
//! Digests follow the `algorithm:hex_digest` format, e.g.
//! `sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855`.
//! Inputs are fed as canonical JSON (`serde_json` maps are sorted), each
//! chunk length-prefixed so that concatenations cannot collide.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::Result;

/// Prefix of every digest produced by this module.
pub const DIGEST_PREFIX: &str = "sha256:";

/// Incremental digest over a sequence of byte chunks.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHasher").finish_non_exhaustive()
    }
}

impl ContentHasher {
    /// Create an empty hasher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one length-prefixed chunk.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
    }

    /// Feed the canonical JSON encoding of a value.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn update_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.update(&bytes);
        Ok(())
    }

    /// Finish and render as `sha256:<hex>`.
    #[must_use]
    pub fn finish(self) -> String {
        format!("{DIGEST_PREFIX}{:x}", self.inner.finalize())
    }
}

/// Digest of a single serializable value.
///
/// # Errors
///
/// Returns error if the value cannot be serialized.
pub fn digest_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut hasher = ContentHasher::new();
    hasher.update_json(value)?;
    Ok(hasher.finish())
}
