//! The stage abstraction for per-record processing.
//!
//! Every filtering step of the pipeline implements [`Stage`]. A stage receives
//! a [`Record`] and answers with a [`StageOutcome`]: keep the (possibly
//! rewritten) record, drop it with a reason, or keep it and ask the whole
//! pipeline to stop. Dropping and stopping are ordinary outcomes, not errors;
//! an `Err` from a stage means the run cannot continue.

use async_trait::async_trait;
use std::fmt;

use crate::error::PipelineError;
use crate::record::Record;

/// Why a record was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    Duplicate,
    NonMatchingSource,
    EmptyText,
    CheckinPattern,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Duplicate => "duplicate",
            DropReason::NonMatchingSource => "non-matching-source",
            DropReason::EmptyText => "empty-text",
            DropReason::CheckinPattern => "checkin-pattern",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the pipeline was asked to stop accepting input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ResultLimitReached,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ResultLimitReached => f.write_str("result-limit-reached"),
        }
    }
}

/// The answer of a stage for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Pass the record on to the next stage.
    Keep(Record),
    /// Discard the record; later stages never see it.
    Drop(DropReason),
    /// Pass the record on, then accept no further input.
    Stop { record: Record, reason: StopReason },
}

/// A single step of the record pipeline.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Processes a single record.
    async fn process(&self, record: Record) -> Result<StageOutcome, PipelineError>;
}
