//! Stage for dropping records that were already seen during this run.
//!
//! The `Deduplicator` keeps the set of record ids it has let through. The set
//! lives exactly as long as the pipeline instance that owns it and is never
//! persisted: a fresh run starts with an empty set, and cross-run idempotence
//! is left to the sinks' upserts.

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::record::Record;
use crate::stage::{DropReason, Stage, StageOutcome};

/// A stage that filters out records whose `id` has already been seen.
pub struct Deduplicator {
    seen_ids: DashSet<String>,
}

impl Deduplicator {
    /// Creates a new `Deduplicator` with an empty seen set.
    pub fn new() -> Self {
        info!("Initializing Deduplicator");
        Deduplicator {
            seen_ids: DashSet::new(),
        }
    }

    /// Number of distinct ids seen so far.
    pub fn seen_count(&self) -> usize {
        self.seen_ids.len()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for Deduplicator {
    fn name(&self) -> &str {
        "Deduplicator"
    }

    async fn process(&self, record: Record) -> Result<StageOutcome, PipelineError> {
        if record.id.trim().is_empty() {
            return Err(PipelineError::MissingId);
        }

        // `insert` is the atomic check-and-insert; concurrent callers racing on
        // the same id see exactly one `true`.
        if self.seen_ids.insert(record.id.clone()) {
            debug!("Unique record {}, passing through.", record.id);
            Ok(StageOutcome::Keep(record))
        } else {
            debug!("Duplicate record {} detected, dropping.", record.id);
            Ok(StageOutcome::Drop(DropReason::Duplicate))
        }
    }
}
