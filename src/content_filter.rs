//! Stage for keeping only posts from the allow-listed super-topic.
//!
//! Rules, applied in order: the source must match, the text must be
//! non-empty, and the text must not be a daily check-in ("Day3", "day 12").
//! Surviving records have the source label cut out of their text. Once the
//! configured number of records has passed, the stage answers with
//! [`StageOutcome::Stop`] so the pipeline accepts no further input.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::record::Record;
use crate::stage::{DropReason, Stage, StageOutcome, StopReason};

static CHECKIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)day\s*[0-9]+").expect("static regex is valid"));

pub struct ContentFilter {
    allowed_source: String,
    source_label: String,
    result_limit: usize,
    passed: AtomicUsize,
}

impl ContentFilter {
    /// `result_limit` of 0 means unlimited.
    pub fn new(
        allowed_source: impl Into<String>,
        source_label: impl Into<String>,
        result_limit: usize,
    ) -> Self {
        let allowed_source = allowed_source.into();
        let source_label = source_label.into();
        info!(
            "Initializing ContentFilter for source {:?} (result limit {})",
            allowed_source, result_limit
        );
        ContentFilter {
            allowed_source,
            source_label,
            result_limit,
            passed: AtomicUsize::new(0),
        }
    }

    /// Records that passed every rule so far.
    pub fn passed_count(&self) -> usize {
        self.passed.load(Ordering::SeqCst)
    }

    fn check(&self, record: &Record) -> Option<DropReason> {
        if record.source != self.allowed_source {
            return Some(DropReason::NonMatchingSource);
        }
        if record.text.is_empty() {
            return Some(DropReason::EmptyText);
        }
        if CHECKIN_RE.is_match(&record.text) {
            return Some(DropReason::CheckinPattern);
        }
        None
    }
}

#[async_trait]
impl Stage for ContentFilter {
    fn name(&self) -> &str {
        "ContentFilter"
    }

    async fn process(&self, mut record: Record) -> Result<StageOutcome, PipelineError> {
        if let Some(reason) = self.check(&record) {
            debug!("Dropping record {}: {}", record.id, reason);
            return Ok(StageOutcome::Drop(reason));
        }

        if !self.source_label.is_empty() {
            record.text = record.text.replace(&self.source_label, "");
        }
        record.text = record.text.trim().to_string();

        let passed = self.passed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.result_limit > 0 && passed >= self.result_limit {
            info!(
                "Result limit of {} reached with record {}, stopping.",
                self.result_limit, record.id
            );
            return Ok(StageOutcome::Stop {
                record,
                reason: StopReason::ResultLimitReached,
            });
        }
        Ok(StageOutcome::Keep(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "黄霄云超话";

    fn record(source: &str, text: &str) -> Record {
        Record {
            id: "1".into(),
            source: source.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    async fn run(filter: &ContentFilter, source: &str, text: &str) -> StageOutcome {
        filter.process(record(source, text)).await.unwrap()
    }

    #[tokio::test]
    async fn other_sources_are_dropped() {
        let filter = ContentFilter::new(SOURCE, SOURCE, 0);
        for source in ["", "iPhone客户端", "黄霄云超话 ", "微博 weibo.com"] {
            assert_eq!(
                run(&filter, source, "祝福").await,
                StageOutcome::Drop(DropReason::NonMatchingSource)
            );
        }
        assert_eq!(filter.passed_count(), 0);
    }

    #[tokio::test]
    async fn empty_text_is_dropped() {
        let filter = ContentFilter::new(SOURCE, SOURCE, 0);
        assert_eq!(
            run(&filter, SOURCE, "").await,
            StageOutcome::Drop(DropReason::EmptyText)
        );
    }

    #[tokio::test]
    async fn checkin_posts_are_dropped() {
        let filter = ContentFilter::new(SOURCE, SOURCE, 0);
        for text in ["黄霄云超话 Day3 打卡", "day 12", "DAY7", "第一天 dAy  100"] {
            assert_eq!(
                run(&filter, SOURCE, text).await,
                StageOutcome::Drop(DropReason::CheckinPattern),
                "{}",
                text
            );
        }
    }

    #[tokio::test]
    async fn label_is_removed_and_text_trimmed() {
        let filter = ContentFilter::new(SOURCE, SOURCE, 0);
        match run(&filter, SOURCE, "黄霄云超话 生日快乐 黄霄云超话").await {
            StageOutcome::Keep(r) => assert_eq!(r.text, "生日快乐"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(filter.passed_count(), 1);
    }

    #[tokio::test]
    async fn stops_once_limit_is_reached() {
        let filter = ContentFilter::new(SOURCE, SOURCE, 3);
        assert!(matches!(run(&filter, SOURCE, "一").await, StageOutcome::Keep(_)));
        assert!(matches!(run(&filter, SOURCE, "二").await, StageOutcome::Keep(_)));
        match run(&filter, SOURCE, "三").await {
            StageOutcome::Stop { record, reason } => {
                assert_eq!(record.text, "三");
                assert_eq!(reason, StopReason::ResultLimitReached);
            }
            other => panic!("expected stop, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropped_records_do_not_count_towards_limit() {
        let filter = ContentFilter::new(SOURCE, SOURCE, 1);
        assert!(matches!(run(&filter, "other", "x").await, StageOutcome::Drop(_)));
        assert!(matches!(run(&filter, SOURCE, "day1").await, StageOutcome::Drop(_)));
        assert!(matches!(run(&filter, SOURCE, "x").await, StageOutcome::Stop { .. }));
    }
}
