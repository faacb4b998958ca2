//! Pipeline configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. The defaults reproduce the settings the crawler has always
//! shipped with: results under `结果文件`, the curated per-user file under
//! `过滤结果`, only the delimited-file sink enabled.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const DEFAULT_SOURCE: &str = "黄霄云超话";
pub const DEFAULT_OUTPUT_DIR: &str = "结果文件";
pub const DEFAULT_RESULTS_ROOT: &str = "过滤结果";
pub const LATEST_STORE_FILE_NAME: &str = "blessData.json";

/// Top-level configuration of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Search terms the crawler was asked for. Informational only.
    pub keywords: Vec<String>,
    /// The only `source` value the content filter lets through.
    pub allowed_source: String,
    /// Label removed from post text; defaults to `allowed_source`.
    pub source_label: Option<String>,
    /// Stop after this many records pass filtering. 0 means unlimited.
    pub result_limit: usize,
    /// Root directory for per-keyword output and media.
    pub output_dir: PathBuf,
    /// The latest-per-user store; `None` disables it.
    pub latest_store: Option<LatestStoreConfig>,
    pub sinks: SinkConfig,
    /// Upper bound for a single sink write.
    pub sink_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            allowed_source: DEFAULT_SOURCE.to_string(),
            source_label: None,
            result_limit: 0,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            latest_store: Some(LatestStoreConfig::default()),
            sinks: SinkConfig::default(),
            sink_timeout_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration from a JSON file; missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = serde_json::from_str(raw)
            .map_err(|e| PipelineError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.allowed_source.is_empty() {
            return Err(PipelineError::Config(
                "allowed_source must not be empty".to_string(),
            ));
        }
        if self.sink_timeout_ms == 0 {
            return Err(PipelineError::Config(
                "sink_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(store) = &self.latest_store {
            if store.persist_every == 0 {
                return Err(PipelineError::Config(
                    "latest_store.persist_every must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The label stripped from post text by the content filter.
    pub fn source_label(&self) -> &str {
        self.source_label.as_deref().unwrap_or(&self.allowed_source)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatestStoreConfig {
    /// Explicit backing file; overrides `results_root`.
    pub path: Option<PathBuf>,
    pub results_root: PathBuf,
    /// Persist after this many changed merges. 1 writes after every change.
    pub persist_every: usize,
}

impl Default for LatestStoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            results_root: PathBuf::from(DEFAULT_RESULTS_ROOT),
            persist_every: 1,
        }
    }
}

impl LatestStoreConfig {
    /// The backing file, `<results_root>/blessData.json` unless set explicitly.
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| self.results_root.join(LATEST_STORE_FILE_NAME))
    }
}

/// Which storage sinks are enabled. A present entry means enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub csv: Option<CsvSinkConfig>,
    pub sqlite: Option<SqliteSinkConfig>,
    pub mysql: Option<MysqlSinkConfig>,
    pub mongo: Option<MongoSinkConfig>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            csv: Some(CsvSinkConfig::default()),
            sqlite: None,
            mysql: None,
            mongo: None,
        }
    }
}

impl SinkConfig {
    /// No sinks at all.
    pub fn none() -> Self {
        Self {
            csv: None,
            sqlite: None,
            mysql: None,
            mongo: None,
        }
    }

    pub fn enabled_count(&self) -> usize {
        [
            self.csv.is_some(),
            self.sqlite.is_some(),
            self.mysql.is_some(),
            self.mongo.is_some(),
        ]
        .iter()
        .filter(|enabled| **enabled)
        .count()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvSinkConfig {
    /// Root directory; defaults to the pipeline's `output_dir`.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSinkConfig {
    /// Database file; defaults to `<output_dir>/weibo.db`.
    pub path: Option<PathBuf>,
    pub table: String,
}

impl Default for SqliteSinkConfig {
    fn default() -> Self {
        Self {
            path: None,
            table: "weibo".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlSinkConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub table: String,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
}

impl Default for MysqlSinkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: "123456".to_string(),
            database: "weibo".to_string(),
            table: "weibo".to_string(),
            max_connections: 5,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoSinkConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
    pub server_selection_timeout_ms: u64,
}

impl Default for MongoSinkConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "weibo".to_string(),
            collection: "weibo".to_string(),
            server_selection_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = PipelineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.source_label(), DEFAULT_SOURCE);
        assert_eq!(config.sinks.enabled_count(), 1);
        assert_eq!(
            config.latest_store.unwrap().resolved_path(),
            Path::new("过滤结果").join("blessData.json")
        );
    }

    #[test]
    fn partial_sink_sections_fill_in_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "result_limit": 3,
                "source_label": "超话",
                "latest_store": null,
                "sinks": { "csv": null, "mysql": { "host": "db" }, "mongo": {} }
            }"#,
        )
        .unwrap();
        assert_eq!(config.result_limit, 3);
        assert_eq!(config.source_label(), "超话");
        assert!(config.latest_store.is_none());
        assert!(config.sinks.csv.is_none());
        let mysql = config.sinks.mysql.unwrap();
        assert_eq!(mysql.host, "db");
        assert_eq!(mysql.port, 3306);
        assert_eq!(mysql.database, "weibo");
        assert_eq!(config.sinks.mongo.unwrap().uri, "mongodb://localhost:27017");
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(PipelineConfig::from_json_str(r#"{"allowed_source": ""}"#).is_err());
        assert!(PipelineConfig::from_json_str(r#"{"sink_timeout_ms": 0}"#).is_err());
        assert!(
            PipelineConfig::from_json_str(r#"{"latest_store": {"persist_every": 0}}"#).is_err()
        );
        assert!(matches!(
            PipelineConfig::from_json_str("not json"),
            Err(PipelineError::Config(_))
        ));
    }
}
