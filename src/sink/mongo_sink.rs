//! Sink for persisting records to a MongoDB collection.
//!
//! Each record becomes one document with the same columns and values as the
//! relational tables, plus the `schema_version` they were written with. Writes
//! replace the document whose `id` matches, inserting it when absent.

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, ReplaceOptions};
use mongodb::{Client, Collection};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::Sink;
use crate::config::MongoSinkConfig;
use crate::error::PipelineError;
use crate::record::{FieldValue, Record, COLUMNS, SCHEMA_VERSION};

pub struct MongoSink {
    config: MongoSinkConfig,
    state: OnceCell<(Client, Collection<Document>)>,
}

impl MongoSink {
    pub fn new(config: MongoSinkConfig) -> Self {
        info!(
            "Initializing MongoSink for {}/{}",
            config.database, config.collection
        );
        MongoSink {
            config,
            state: OnceCell::new(),
        }
    }
}

/// The stored form of a record: one field per schema column.
pub fn to_document(record: &Record) -> Document {
    let mut document = Document::new();
    for (column, value) in COLUMNS.iter().zip(record.column_values()) {
        let value = match value {
            FieldValue::Text(s) => Bson::String(s),
            FieldValue::Integer(n) => Bson::Int64(n),
        };
        document.insert(column.name, value);
    }
    document.insert("schema_version", i64::from(SCHEMA_VERSION));
    document
}

#[async_trait]
impl Sink for MongoSink {
    fn name(&self) -> &str {
        "MongoSink"
    }

    async fn open(&self) -> Result<(), PipelineError> {
        let mut options = ClientOptions::parse(&self.config.uri).await?;
        options.server_selection_timeout =
            Some(Duration::from_millis(self.config.server_selection_timeout_ms));
        options.app_name = Some("weibo-pipeline".to_string());
        let client = Client::with_options(options)?;

        // Fail now rather than on the first write if the server is unreachable.
        client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await?;

        let collection = client
            .database(&self.config.database)
            .collection::<Document>(&self.config.collection);
        self.state
            .set((client, collection))
            .map_err(|_| PipelineError::Other("MongoSink opened twice".to_string()))?;
        info!("MongoSink connected to {}", self.config.database);
        Ok(())
    }

    async fn upsert(&self, record: &Record) -> Result<(), PipelineError> {
        let (_, collection) = self
            .state
            .get()
            .ok_or_else(|| PipelineError::Other("MongoDB client is not open".to_string()))?;

        let document = to_document(record);
        let options = ReplaceOptions::builder().upsert(true).build();
        let result = collection
            .replace_one(doc! { "id": record.id.as_str() }, document, options)
            .await?;
        debug!(
            "Record {} upserted into MongoDB (matched {})",
            record.id, result.matched_count
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), PipelineError> {
        if let Some((client, _)) = self.state.get() {
            client.clone().shutdown().await;
            info!("MongoSink closed.");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_uses_the_table_columns() {
        let record = Record {
            id: "4981".into(),
            username: "云朵".into(),
            pics: vec!["https://a/1.jpg".into(), "https://a/2.jpg".into()],
            reposts_count: 2,
            keyword: "生日快乐".into(),
            ..Default::default()
        };
        let document = to_document(&record);
        let keys: Vec<&str> = document.keys().map(String::as_str).collect();
        let mut expected: Vec<&str> = COLUMNS.iter().map(|c| c.name).collect();
        expected.push("schema_version");
        assert_eq!(keys, expected);

        assert_eq!(document.get_str("id").unwrap(), "4981");
        assert_eq!(document.get_str("screen_name").unwrap(), "云朵");
        assert_eq!(document.get_i64("reposts_count").unwrap(), 2);
        assert_eq!(
            document.get_str("pics").unwrap(),
            "https://a/1.jpg,https://a/2.jpg"
        );
        assert_eq!(document.get_str("video_url").unwrap(), "");
        assert_eq!(document.get_i64("schema_version").unwrap(), 1);
        assert!(!document.contains_key("keyword"));
        assert!(!document.contains_key("username"));
    }

    #[tokio::test]
    async fn upsert_without_open_fails() {
        let sink = MongoSink::new(MongoSinkConfig::default());
        assert!(sink.upsert(&Record::default()).await.is_err());
    }
}
