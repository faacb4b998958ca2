//! The record pipeline: ordered stages, then fan-out to storage.
//!
//! A [`Pipeline`] pulls records from a producer one at a time and runs each
//! through its stages in order. The first `Drop` ends processing of that
//! record. A record that survives every stage is, concurrently, merged into
//! the latest-per-user store, dispatched to the sinks and handed to the media
//! fetcher. A `Stop` from a stage lets the current record through and then
//! cancels the pipeline's [`CancellationToken`], which the run loop checks
//! before pulling the next record; producers can watch the same token.
//!
//! All mutable state (seen ids, pass counter, latest map, sink health)
//! belongs to the pipeline instance; two pipelines never share anything.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::content_filter::ContentFilter;
use crate::deduplication::Deduplicator;
use crate::error::{FailureKind, PipelineError};
use crate::latest_store::LatestByKeyStore;
use crate::media::{MediaFetcher, MediaPathResolver};
use crate::record::{FilteredRecord, Record};
use crate::sink::{SinkDispatcher, SinkStats};
use crate::stage::{DropReason, Stage, StageOutcome, StopReason};
use crate::text::normalize;

const DEFAULT_MEDIA_TIMEOUT: Duration = Duration::from_secs(60);

/// What happened to one record.
///
/// `stop` is set when a stage asked the pipeline to accept no further input,
/// even if a later stage then dropped the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The record passed every stage and was delivered.
    Accepted { stop: Option<StopReason> },
    Dropped {
        reason: DropReason,
        stop: Option<StopReason>,
    },
}

impl RecordOutcome {
    pub fn stop(&self) -> Option<StopReason> {
        match self {
            RecordOutcome::Accepted { stop } | RecordOutcome::Dropped { stop, .. } => *stop,
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// The producer ran out of records.
    Completed,
    /// A stage asked to stop; this is a normal ending.
    Stopped(StopReason),
    Failed(PipelineError),
}

/// Counters collected over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub seen: u64,
    pub dropped_duplicate: u64,
    /// Records dropped by content rules, all reasons together.
    pub dropped_filtered: u64,
    pub dropped_by_reason: BTreeMap<DropReason, u64>,
    pub passed: u64,
    /// Records that changed the latest-per-user store.
    pub merged: u64,
    pub media_requests: u64,
    pub media_failures: u64,
    pub sinks: BTreeMap<String, SinkStats>,
}

impl PipelineStats {
    pub fn sink_write_failures(&self) -> u64 {
        self.sinks.values().map(|s| s.failures).sum()
    }
}

/// The single terminal result handed back to the caller of [`Pipeline::run`].
#[derive(Debug)]
pub struct PipelineReport {
    pub outcome: PipelineOutcome,
    pub stats: PipelineStats,
}

impl PipelineReport {
    /// `true` unless the run failed.
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, PipelineOutcome::Failed(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            PipelineOutcome::Failed(e) => Some(e.category()),
            _ => None,
        }
    }

    /// Process exit code for the crawler: 0 on completion or stop, 1 on failure.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

#[derive(Default)]
struct Counters {
    seen: AtomicU64,
    dropped: [AtomicU64; 4],
    passed: AtomicU64,
    merged: AtomicU64,
    media_requests: AtomicU64,
    media_failures: AtomicU64,
}

const DROP_REASONS: [DropReason; 4] = [
    DropReason::Duplicate,
    DropReason::NonMatchingSource,
    DropReason::EmptyText,
    DropReason::CheckinPattern,
];

impl Counters {
    fn record_drop(&self, reason: DropReason) {
        let idx = DROP_REASONS
            .iter()
            .position(|r| *r == reason)
            .unwrap_or_default();
        self.dropped[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, sinks: BTreeMap<String, SinkStats>) -> PipelineStats {
        let dropped_by_reason: BTreeMap<DropReason, u64> = DROP_REASONS
            .iter()
            .zip(self.dropped.iter())
            .map(|(reason, n)| (*reason, n.load(Ordering::Relaxed)))
            .filter(|(_, n)| *n > 0)
            .collect();
        let dropped_duplicate = dropped_by_reason
            .get(&DropReason::Duplicate)
            .copied()
            .unwrap_or_default();
        let dropped_filtered = dropped_by_reason.values().sum::<u64>() - dropped_duplicate;

        PipelineStats {
            seen: self.seen.load(Ordering::Relaxed),
            dropped_duplicate,
            dropped_filtered,
            dropped_by_reason,
            passed: self.passed.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            media_requests: self.media_requests.load(Ordering::Relaxed),
            media_failures: self.media_failures.load(Ordering::Relaxed),
            sinks,
        }
    }
}

/// Assembles a [`Pipeline`].
pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
    latest: Option<LatestByKeyStore>,
    sinks: SinkDispatcher,
    media_resolver: Option<MediaPathResolver>,
    media_fetcher: Option<Box<dyn MediaFetcher>>,
    media_timeout: Duration,
    cancel: CancellationToken,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    /// An empty builder: no stages, no store, no sinks.
    pub fn new() -> Self {
        PipelineBuilder {
            stages: Vec::new(),
            latest: None,
            sinks: SinkDispatcher::new(Duration::from_secs(10)),
            media_resolver: None,
            media_fetcher: None,
            media_timeout: DEFAULT_MEDIA_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// The standard pipeline described by `config`: deduplication, content
    /// filtering, the latest-per-user store and the configured sinks.
    ///
    /// Loads the store's backing file; a malformed file is an error.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let latest = match &config.latest_store {
            Some(store) => Some(
                LatestByKeyStore::open(store.resolved_path(), store.persist_every).await?,
            ),
            None => None,
        };

        Ok(PipelineBuilder::new()
            .stage(Deduplicator::new())
            .stage(ContentFilter::new(
                config.allowed_source.clone(),
                config.source_label(),
                config.result_limit,
            ))
            .with_latest_store(latest)
            .sinks(SinkDispatcher::from_config(config))
            .media_resolver(MediaPathResolver::new(config.output_dir.clone()))
            .media_timeout(config.sink_timeout()))
    }

    /// Appends a stage; stages run in the order they were added.
    pub fn stage(mut self, stage: impl Stage) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn latest_store(self, store: LatestByKeyStore) -> Self {
        self.with_latest_store(Some(store))
    }

    fn with_latest_store(mut self, store: Option<LatestByKeyStore>) -> Self {
        self.latest = store;
        self
    }

    pub fn sinks(mut self, sinks: SinkDispatcher) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn media_resolver(mut self, resolver: MediaPathResolver) -> Self {
        self.media_resolver = Some(resolver);
        self
    }

    /// Fetcher for the media of accepted records. Without one, no media is fetched.
    pub fn media_fetcher(mut self, fetcher: impl MediaFetcher) -> Self {
        self.media_fetcher = Some(Box::new(fetcher));
        self
    }

    pub fn media_timeout(mut self, timeout: Duration) -> Self {
        self.media_timeout = timeout;
        self
    }

    /// Use a token shared with the record producer.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Opens the sinks and returns the ready pipeline.
    pub async fn build(self) -> Result<Pipeline, PipelineError> {
        self.sinks.open_all().await?;
        if self.sinks.is_empty() && self.latest.is_none() {
            warn!(
                "Pipeline has neither sinks nor a latest-per-user store; accepted records are discarded."
            );
        }
        info!(
            "Pipeline ready: {} stages, {} sinks, latest store {}",
            self.stages.len(),
            self.sinks.len(),
            if self.latest.is_some() { "on" } else { "off" }
        );

        let media = match (self.media_resolver, self.media_fetcher) {
            (Some(resolver), Some(fetcher)) => Some((resolver, fetcher)),
            (None, Some(fetcher)) => Some((MediaPathResolver::new("."), fetcher)),
            _ => None,
        };

        Ok(Pipeline {
            stages: self.stages,
            latest: self.latest,
            sinks: self.sinks,
            media,
            media_timeout: self.media_timeout,
            counters: Counters::default(),
            cancel: self.cancel,
        })
    }
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    latest: Option<LatestByKeyStore>,
    sinks: SinkDispatcher,
    media: Option<(MediaPathResolver, Box<dyn MediaFetcher>)>,
    media_timeout: Duration,
    counters: Counters,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Builds the standard pipeline for `config` and opens it.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        PipelineBuilder::from_config(config).await?.build().await
    }

    /// Token cancelled when the pipeline stops accepting input.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn latest_store(&self) -> Option<&LatestByKeyStore> {
        self.latest.as_ref()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot(self.sinks.stats())
    }

    /// Runs one record through the stages and, if it survives, delivers it.
    pub async fn process_record(&self, record: Record) -> Result<RecordOutcome, PipelineError> {
        self.counters.seen.fetch_add(1, Ordering::Relaxed);

        let mut current = record;
        let mut stop = None;
        for stage in &self.stages {
            match stage.process(current).await? {
                StageOutcome::Keep(record) => current = record,
                StageOutcome::Drop(reason) => {
                    debug!("Stage {} dropped a record: {}", stage.name(), reason);
                    self.counters.record_drop(reason);
                    if stop.is_some() {
                        self.cancel.cancel();
                    }
                    return Ok(RecordOutcome::Dropped { reason, stop });
                }
                StageOutcome::Stop { record, reason } => {
                    info!("Stage {} requested stop: {}", stage.name(), reason);
                    stop = Some(reason);
                    current = record;
                }
            }
        }

        self.counters.passed.fetch_add(1, Ordering::Relaxed);
        self.deliver(&current).await?;

        if stop.is_some() {
            self.cancel.cancel();
        }
        Ok(RecordOutcome::Accepted { stop })
    }

    async fn deliver(&self, record: &Record) -> Result<(), PipelineError> {
        let merge = async {
            match &self.latest {
                Some(store) => {
                    let filtered = FilteredRecord::from_record(record, normalize(&record.text));
                    store.merge(filtered).await.map(|outcome| outcome.changed())
                }
                None => Ok(false),
            }
        };

        let (merged, _stored, ()) =
            tokio::join!(merge, self.sinks.dispatch(record), self.fetch_media(record));
        if merged? {
            self.counters.merged.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn fetch_media(&self, record: &Record) {
        let Some((resolver, fetcher)) = &self.media else {
            return;
        };
        let requests = resolver.resolve(record);
        if requests.is_empty() {
            return;
        }
        self.counters
            .media_requests
            .fetch_add(requests.len() as u64, Ordering::Relaxed);

        let fetches = requests.iter().map(|request| async move {
            match tokio::time::timeout(self.media_timeout, fetcher.fetch(request)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("Failed to fetch {} to {:?}: {}", request.url, request.path, e);
                    false
                }
                Err(_) => {
                    warn!("Fetching {} timed out after {:?}", request.url, self.media_timeout);
                    false
                }
            }
        });
        let failures = join_all(fetches).await.into_iter().filter(|ok| !ok).count();
        self.counters
            .media_failures
            .fetch_add(failures as u64, Ordering::Relaxed);
    }

    /// Consumes records until the producer ends, a stage stops the pipeline,
    /// the token is cancelled, or a record fails. Sinks are closed and the
    /// store flushed before returning.
    pub async fn run<S>(self, records: S) -> PipelineReport
    where
        S: Stream<Item = Record>,
    {
        tokio::pin!(records);
        let mut outcome = PipelineOutcome::Completed;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Pipeline cancelled by the producer.");
                    None
                }
                next = records.next() => next,
            };
            let Some(record) = next else {
                break;
            };

            match self.process_record(record).await {
                Ok(processed) => {
                    if let Some(reason) = processed.stop() {
                        outcome = PipelineOutcome::Stopped(reason);
                        break;
                    }
                }
                Err(e) => {
                    error!("Pipeline failed: {}", e);
                    self.cancel.cancel();
                    outcome = PipelineOutcome::Failed(e);
                    break;
                }
            }
        }

        let stats = match self.finish().await {
            Ok(stats) => stats,
            Err((e, stats)) => {
                if !matches!(outcome, PipelineOutcome::Failed(_)) {
                    outcome = PipelineOutcome::Failed(e);
                }
                stats
            }
        };
        PipelineReport { outcome, stats }
    }

    /// Flushes the store and closes the sinks.
    pub async fn finish(self) -> Result<PipelineStats, (PipelineError, PipelineStats)> {
        let flushed = match &self.latest {
            Some(store) => store.flush().await,
            None => Ok(()),
        };
        self.sinks.close_all().await;

        let stats = self.stats();
        info!(
            "Pipeline finished: seen {}, passed {}, duplicates {}, filtered {}, sink failures {}",
            stats.seen,
            stats.passed,
            stats.dropped_duplicate,
            stats.dropped_filtered,
            stats.sink_write_failures()
        );
        if let Some(store) = &self.latest {
            info!(
                "Latest-per-user store {:?} holds {} entries",
                store.path(),
                store.len().await
            );
        }
        match flushed {
            Ok(()) => Ok(stats),
            Err(e) => Err((e, stats)),
        }
    }
}
