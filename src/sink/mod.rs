//! Storage sinks and the dispatcher that fans records out to them.
//!
//! A [`Sink`] durably stores accepted records with an upsert keyed by the
//! record id, so delivering the same record twice leaves the stored state
//! unchanged. Sinks are independent: the [`SinkDispatcher`] writes to all of
//! them concurrently, bounds each write with a timeout, and records failures
//! per sink without ever failing the record itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::record::Record;

#[cfg(feature = "sink-csv")]
pub mod csv_sink;

#[cfg(feature = "sink-sqlite")]
pub mod sqlite_sink;

#[cfg(feature = "sink-mysql")]
pub mod mysql_sink;

#[cfg(feature = "sink-mongo")]
pub mod mongo_sink;

#[cfg(any(feature = "sink-sqlite", feature = "sink-mysql"))]
pub mod sql;

/// A storage backend for accepted records.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Returns the name of the sink.
    fn name(&self) -> &str;

    /// Connects and prepares storage (databases, tables, directories).
    async fn open(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Inserts the record, or overwrites the stored record with the same id.
    async fn upsert(&self, record: &Record) -> Result<(), PipelineError>;

    /// Releases connections and file handles.
    async fn close(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Health of a sink as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkHealth {
    /// Not opened yet.
    Pending,
    Healthy,
    /// The last write failed; later records are still attempted.
    Degraded,
    /// Opening failed; the sink is skipped for the rest of the run.
    Unavailable,
}

impl SinkHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SinkHealth::Healthy,
            2 => SinkHealth::Degraded,
            3 => SinkHealth::Unavailable,
            _ => SinkHealth::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SinkHealth::Pending => 0,
            SinkHealth::Healthy => 1,
            SinkHealth::Degraded => 2,
            SinkHealth::Unavailable => 3,
        }
    }
}

struct SinkSlot {
    name: String,
    /// `None` when the driver for a configured sink is not compiled in.
    sink: Option<Box<dyn Sink>>,
    health: AtomicU8,
    failures: AtomicU64,
    writes: AtomicU64,
}

impl SinkSlot {
    fn health(&self) -> SinkHealth {
        SinkHealth::from_u8(self.health.load(Ordering::SeqCst))
    }

    fn set_health(&self, health: SinkHealth) {
        self.health.store(health.as_u8(), Ordering::SeqCst);
    }
}

/// Per-sink counters for the run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkStats {
    pub health: SinkHealth,
    pub writes: u64,
    pub failures: u64,
}

/// Fans records out to every configured sink.
pub struct SinkDispatcher {
    slots: Vec<SinkSlot>,
    timeout: Duration,
}

impl SinkDispatcher {
    pub fn new(timeout: Duration) -> Self {
        SinkDispatcher {
            slots: Vec::new(),
            timeout,
        }
    }

    /// Builds the dispatcher for the sinks enabled in `config`.
    ///
    /// Sinks whose driver was not compiled in are registered as unavailable,
    /// the same as a sink that fails to connect.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut dispatcher = SinkDispatcher::new(config.sink_timeout());
        let sinks = &config.sinks;

        if let Some(csv) = &sinks.csv {
            #[cfg(feature = "sink-csv")]
            {
                let root = csv.root.clone().unwrap_or_else(|| config.output_dir.clone());
                dispatcher.add_sink(csv_sink::CsvSink::new(root));
            }
            #[cfg(not(feature = "sink-csv"))]
            {
                let _ = csv;
                dispatcher.add_missing_driver("CsvSink");
            }
        }

        if let Some(sqlite) = &sinks.sqlite {
            #[cfg(feature = "sink-sqlite")]
            {
                let path = sqlite
                    .path
                    .clone()
                    .unwrap_or_else(|| config.output_dir.join("weibo.db"));
                dispatcher.add_sink(sqlite_sink::SqliteSink::new(path, sqlite.table.clone()));
            }
            #[cfg(not(feature = "sink-sqlite"))]
            {
                let _ = sqlite;
                dispatcher.add_missing_driver("SqliteSink");
            }
        }

        if let Some(mysql) = &sinks.mysql {
            #[cfg(feature = "sink-mysql")]
            dispatcher.add_sink(mysql_sink::MysqlSink::new(mysql.clone()));
            #[cfg(not(feature = "sink-mysql"))]
            {
                let _ = mysql;
                dispatcher.add_missing_driver("MysqlSink");
            }
        }

        if let Some(mongo) = &sinks.mongo {
            #[cfg(feature = "sink-mongo")]
            dispatcher.add_sink(mongo_sink::MongoSink::new(mongo.clone()));
            #[cfg(not(feature = "sink-mongo"))]
            {
                let _ = mongo;
                dispatcher.add_missing_driver("MongoSink");
            }
        }

        dispatcher
    }

    pub fn add_sink(&mut self, sink: impl Sink) {
        self.add_boxed(Box::new(sink));
    }

    pub fn add_boxed(&mut self, sink: Box<dyn Sink>) {
        self.slots.push(SinkSlot {
            name: sink.name().to_string(),
            sink: Some(sink),
            health: AtomicU8::new(SinkHealth::Pending.as_u8()),
            failures: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        });
    }

    #[allow(dead_code)]
    fn add_missing_driver(&mut self, name: &str) {
        self.slots.push(SinkSlot {
            name: name.to_string(),
            sink: None,
            health: AtomicU8::new(SinkHealth::Pending.as_u8()),
            failures: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Opens every sink. Fails only if sinks were configured and none opened.
    pub async fn open_all(&self) -> Result<(), PipelineError> {
        for slot in &self.slots {
            let Some(sink) = &slot.sink else {
                error!(
                    "Sink {} is configured but its driver is not compiled in; disabling it.",
                    slot.name
                );
                slot.set_health(SinkHealth::Unavailable);
                continue;
            };
            match tokio::time::timeout(self.timeout, sink.open()).await {
                Ok(Ok(())) => {
                    info!("Sink {} opened.", slot.name);
                    slot.set_health(SinkHealth::Healthy);
                }
                Ok(Err(e)) => {
                    error!("Failed to open sink {}: {}; disabling it.", slot.name, e);
                    slot.set_health(SinkHealth::Unavailable);
                }
                Err(_) => {
                    error!(
                        "Opening sink {} timed out after {:?}; disabling it.",
                        slot.name, self.timeout
                    );
                    slot.set_health(SinkHealth::Unavailable);
                }
            }
        }

        let usable = self
            .slots
            .iter()
            .filter(|s| s.health() != SinkHealth::Unavailable)
            .count();
        if !self.slots.is_empty() && usable == 0 {
            return Err(PipelineError::Startup(format!(
                "none of the {} configured sinks could be opened",
                self.slots.len()
            )));
        }
        Ok(())
    }

    /// Delivers `record` to every usable sink. Failures are counted, not returned.
    ///
    /// Returns the number of sinks that stored the record.
    pub async fn dispatch(&self, record: &Record) -> usize {
        let writes = self
            .slots
            .iter()
            .filter(|slot| slot.health() != SinkHealth::Unavailable)
            .filter_map(|slot| slot.sink.as_ref().map(|sink| (slot, sink)))
            .map(|(slot, sink)| async move {
                let result = match tokio::time::timeout(self.timeout, sink.upsert(record)).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Timeout {
                        sink: slot.name.clone(),
                        after: self.timeout,
                    }),
                };
                match result {
                    Ok(()) => {
                        debug!("Record {} stored by {}", record.id, slot.name);
                        slot.writes.fetch_add(1, Ordering::SeqCst);
                        slot.set_health(SinkHealth::Healthy);
                        true
                    }
                    Err(e) => {
                        warn!("Sink {} failed to store record {}: {}", slot.name, record.id, e);
                        slot.failures.fetch_add(1, Ordering::SeqCst);
                        slot.set_health(SinkHealth::Degraded);
                        false
                    }
                }
            });

        join_all(writes).await.into_iter().filter(|ok| *ok).count()
    }

    /// Closes every opened sink, logging failures.
    pub async fn close_all(&self) {
        for slot in &self.slots {
            if slot.health() == SinkHealth::Unavailable {
                continue;
            }
            if let Some(sink) = &slot.sink {
                if let Err(e) = sink.close().await {
                    warn!("Error closing sink {}: {}", slot.name, e);
                }
            }
        }
    }

    pub fn health(&self, name: &str) -> Option<SinkHealth> {
        self.slots.iter().find(|s| s.name == name).map(|s| s.health())
    }

    pub fn stats(&self) -> BTreeMap<String, SinkStats> {
        self.slots
            .iter()
            .map(|slot| {
                (
                    slot.name.clone(),
                    SinkStats {
                        health: slot.health(),
                        writes: slot.writes.load(Ordering::SeqCst),
                        failures: slot.failures.load(Ordering::SeqCst),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    struct MemorySink {
        name: String,
        fail_open: bool,
        fail_writes: Arc<AtomicBool>,
        delay: Option<Duration>,
        rows: Arc<Mutex<BTreeMap<String, Record>>>,
    }

    impl MemorySink {
        fn new(name: &str) -> Self {
            MemorySink {
                name: name.to_string(),
                fail_open: false,
                fail_writes: Arc::new(AtomicBool::new(false)),
                delay: None,
                rows: Arc::new(Mutex::new(BTreeMap::new())),
            }
        }
    }

    #[async_trait]
    impl Sink for MemorySink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn open(&self) -> Result<(), PipelineError> {
            if self.fail_open {
                return Err(PipelineError::Other("connection refused".into()));
            }
            Ok(())
        }

        async fn upsert(&self, record: &Record) -> Result<(), PipelineError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PipelineError::Other("write failed".into()));
            }
            self.rows
                .lock()
                .unwrap()
                .insert(record.id.clone(), record.clone());
            Ok(())
        }
    }

    fn record(id: &str) -> Record {
        Record {
            id: id.into(),
            text: "t".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_affect_siblings() {
        let good = MemorySink::new("good");
        let good_rows = Arc::clone(&good.rows);
        let bad = MemorySink::new("bad");
        bad.fail_writes.store(true, Ordering::SeqCst);
        let bad_switch = Arc::clone(&bad.fail_writes);

        let mut dispatcher = SinkDispatcher::new(Duration::from_secs(1));
        dispatcher.add_sink(good);
        dispatcher.add_sink(bad);
        dispatcher.open_all().await.unwrap();

        assert_eq!(dispatcher.dispatch(&record("1")).await, 1);
        assert_eq!(good_rows.lock().unwrap().len(), 1);
        assert_eq!(dispatcher.health("bad"), Some(SinkHealth::Degraded));
        assert_eq!(dispatcher.stats()["bad"].failures, 1);

        bad_switch.store(false, Ordering::SeqCst);
        assert_eq!(dispatcher.dispatch(&record("2")).await, 2);
        assert_eq!(dispatcher.health("bad"), Some(SinkHealth::Healthy));
        assert_eq!(dispatcher.stats()["good"].writes, 2);
    }

    #[tokio::test]
    async fn unopenable_sink_is_skipped() {
        let mut broken = MemorySink::new("broken");
        broken.fail_open = true;
        let broken_rows = Arc::clone(&broken.rows);

        let mut dispatcher = SinkDispatcher::new(Duration::from_secs(1));
        dispatcher.add_sink(MemorySink::new("ok"));
        dispatcher.add_sink(broken);
        dispatcher.open_all().await.unwrap();

        assert_eq!(dispatcher.health("broken"), Some(SinkHealth::Unavailable));
        assert_eq!(dispatcher.dispatch(&record("1")).await, 1);
        assert!(broken_rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_sinks_failing_to_open_is_fatal() {
        let mut broken = MemorySink::new("broken");
        broken.fail_open = true;
        let mut dispatcher = SinkDispatcher::new(Duration::from_secs(1));
        dispatcher.add_sink(broken);
        dispatcher.add_missing_driver("MysqlSink");

        let err = dispatcher.open_all().await.unwrap_err();
        assert!(matches!(err, PipelineError::Startup(_)));
        assert_eq!(dispatcher.health("MysqlSink"), Some(SinkHealth::Unavailable));
    }

    #[tokio::test]
    async fn no_sinks_is_not_an_error() {
        let dispatcher = SinkDispatcher::new(Duration::from_secs(1));
        dispatcher.open_all().await.unwrap();
        assert_eq!(dispatcher.dispatch(&record("1")).await, 0);
    }

    #[tokio::test]
    async fn slow_sink_times_out_without_blocking_others() {
        let mut slow = MemorySink::new("slow");
        slow.delay = Some(Duration::from_secs(30));
        let fast = MemorySink::new("fast");
        let fast_rows = Arc::clone(&fast.rows);

        let mut dispatcher = SinkDispatcher::new(Duration::from_millis(50));
        dispatcher.add_sink(slow);
        dispatcher.add_sink(fast);
        dispatcher.open_all().await.unwrap();

        let started = std::time::Instant::now();
        assert_eq!(dispatcher.dispatch(&record("1")).await, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fast_rows.lock().unwrap().len(), 1);
        assert_eq!(dispatcher.health("slow"), Some(SinkHealth::Degraded));
    }

    #[tokio::test]
    async fn missing_drivers_are_registered_from_config() {
        let config = PipelineConfig::from_json_str(
            r#"{"sinks": {"csv": {}, "mysql": {}, "mongo": {}}}"#,
        )
        .unwrap();
        let dispatcher = SinkDispatcher::from_config(&config);
        assert_eq!(dispatcher.len(), 3);
    }
}
