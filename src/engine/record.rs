//! Computation Record - one execution attempt of one node for one input
//! combination

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::EntityKey;

/// Identity of one computation instance:
/// (node, input key set, parameter fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    node: String,
    input_keys: BTreeMap<String, EntityKey>,
    parameter_fingerprint: String,
}

impl CacheKey {
    /// Create a cache key. `input_keys` maps input entity type to the key of
    /// the input entity used.
    #[must_use]
    pub fn new(
        node: impl Into<String>,
        input_keys: BTreeMap<String, EntityKey>,
        parameter_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            input_keys,
            parameter_fingerprint: parameter_fingerprint.into(),
        }
    }

    /// Get the node (output entity type) name.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Get the input key set.
    #[must_use]
    pub const fn input_keys(&self) -> &BTreeMap<String, EntityKey> {
        &self.input_keys
    }

    /// Get the parameter fingerprint.
    #[must_use]
    pub fn parameter_fingerprint(&self) -> &str {
        &self.parameter_fingerprint
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.node)?;
        for (i, (ty, key)) in self.input_keys.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ty}{key}")?;
        }
        // Short fingerprint is enough to tell parameter sets apart in logs
        let short = self
            .parameter_fingerprint
            .get(..crate::hash::DIGEST_PREFIX.len() + 12)
            .unwrap_or(&self.parameter_fingerprint);
        write!(f, "; {short})")
    }
}

/// Status of a computation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputationStatus {
    /// Planned but not yet started.
    Pending,
    /// Compute function is executing.
    Running,
    /// Output entity persisted.
    Complete,
    /// Compute function failed; `error_reason` is set.
    Failed,
}

impl ComputationStatus {
    /// Whether the record reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for ComputationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Computation Record represents one attempt at producing an output entity.
///
/// The lifecycle is `Pending -> Running -> {Complete, Failed}`. A record is
/// superseded (archived, not deleted) when its cache key is executed again.
/// A complete record names the exact output revision it produced, so
/// superseded attempts still reach their own payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputationRecord {
    cache_key: CacheKey,
    output_key: EntityKey,
    #[serde(default)]
    output_revision: Option<u32>,
    content_hash: String,
    status: ComputationStatus,
    error_reason: Option<String>,
    attempt: u32,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    superseded_at: Option<DateTime<Utc>>,
}

impl ComputationRecord {
    /// Create a new record in Pending status (attempt 1).
    #[must_use]
    pub fn new(cache_key: CacheKey, output_key: EntityKey, content_hash: impl Into<String>) -> Self {
        Self {
            cache_key,
            output_key,
            output_revision: None,
            content_hash: content_hash.into(),
            status: ComputationStatus::Pending,
            error_reason: None,
            attempt: 1,
            started_at: None,
            ended_at: None,
            superseded_at: None,
        }
    }

    /// Get the cache key.
    #[must_use]
    pub const fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// Get the node (output entity type) name.
    #[must_use]
    pub fn node(&self) -> &str {
        self.cache_key.node()
    }

    /// Get the output entity key.
    #[must_use]
    pub const fn output_key(&self) -> &EntityKey {
        &self.output_key
    }

    /// Get the revision of the output entity this attempt produced.
    ///
    /// `None` until the attempt completes.
    #[must_use]
    pub const fn output_revision(&self) -> Option<u32> {
        self.output_revision
    }

    /// Get the content hash of the inputs this attempt used.
    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> ComputationStatus {
        self.status
    }

    /// Get the failure reason, if the attempt failed.
    #[must_use]
    pub fn error_reason(&self) -> Option<&str> {
        self.error_reason.as_deref()
    }

    /// Get the attempt number for this cache key (starting at 1).
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Get the start timestamp, if the attempt has started.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get the end timestamp, if the attempt has finished.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Get the time this record was superseded, if it was.
    #[must_use]
    pub const fn superseded_at(&self) -> Option<DateTime<Utc>> {
        self.superseded_at
    }

    /// Whether a newer attempt replaced this record.
    #[must_use]
    pub const fn is_superseded(&self) -> bool {
        self.superseded_at.is_some()
    }

    /// Whether this record is a valid cache hit for the given content hash.
    ///
    /// Failed and unfinished records never are.
    #[must_use]
    pub fn is_valid_for(&self, content_hash: &str) -> bool {
        self.status == ComputationStatus::Complete
            && !self.is_superseded()
            && self.content_hash == content_hash
    }

    pub(crate) fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Start the attempt, transitioning from Pending to Running.
    ///
    /// Sets the `started_at` timestamp to now.
    pub fn start(&mut self) {
        self.status = ComputationStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Finish the attempt successfully, recording which revision of the
    /// output entity it stored.
    pub fn complete(&mut self, output_revision: u32) {
        self.status = ComputationStatus::Complete;
        self.output_revision = Some(output_revision);
        self.error_reason = None;
        self.ended_at = Some(Utc::now());
    }

    /// Finish the attempt with a failure reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ComputationStatus::Failed;
        self.error_reason = Some(reason.into());
        self.ended_at = Some(Utc::now());
    }

    /// Mark the record as superseded by a newer attempt.
    pub fn supersede(&mut self) {
        self.superseded_at = Some(Utc::now());
    }
}
