//! Sink for persisting records to a SQLite database.
//!
//! The connection lives on a dedicated blocking thread; the async side talks
//! to it through a command channel, so the event loop never blocks on
//! database I/O. The table is created with the fixed column schema on open,
//! and every record is written with an upsert on `id`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, error, info, trace};
use rusqlite::{params_from_iter, Connection};
use tokio::sync::{mpsc, oneshot};

use super::sql::{self, Dialect};
use super::Sink;
use crate::error::PipelineError;
use crate::fs_util;
use crate::record::{FieldValue, Record};

enum SqliteCommand {
    Open(oneshot::Sender<Result<(), PipelineError>>),
    Upsert {
        values: Vec<FieldValue>,
        responder: oneshot::Sender<Result<(), PipelineError>>,
    },
    Shutdown(oneshot::Sender<()>),
}

impl From<FieldValue> for rusqlite::types::Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Text(s) => rusqlite::types::Value::Text(s),
            FieldValue::Integer(n) => rusqlite::types::Value::Integer(n),
        }
    }
}

/// A sink that upserts records into a SQLite table.
pub struct SqliteSink {
    path: PathBuf,
    table: String,
    command_sender: mpsc::Sender<SqliteCommand>,
}

impl SqliteSink {
    /// Creates a new `SqliteSink` for the given database file and table.
    ///
    /// Nothing touches the disk until [`Sink::open`] is called.
    pub fn new(db_path: impl AsRef<Path>, table: impl Into<String>) -> Self {
        let path = db_path.as_ref().to_path_buf();
        let table = table.into();
        info!("Initializing SqliteSink for DB: {:?}, Table: {}", path, table);

        let (command_sender, mut command_receiver) = mpsc::channel::<SqliteCommand>(100);
        let db_path = path.clone();
        let table_name = table.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn: Option<Connection> = None;

            while let Some(command) = command_receiver.blocking_recv() {
                match command {
                    SqliteCommand::Open(responder) => {
                        trace!("Processing Open command");
                        let result = open_sync(&db_path, &table_name).map(|c| {
                            conn = Some(c);
                        });
                        if responder.send(result).is_err() {
                            error!("Failed to send Open response");
                        }
                    }
                    SqliteCommand::Upsert { values, responder } => {
                        trace!("Processing Upsert command");
                        let result = match conn.as_mut() {
                            Some(c) => upsert_sync(c, &table_name, values),
                            None => Err(PipelineError::Other(
                                "SQLite connection is not open".to_string(),
                            )),
                        };
                        if responder.send(result).is_err() {
                            error!("Failed to send Upsert response");
                        }
                    }
                    SqliteCommand::Shutdown(responder) => {
                        debug!("SQLite blocking task received shutdown command.");
                        let _ = responder.send(());
                        break;
                    }
                }
            }

            if let Some(c) = conn.take() {
                if let Err((_, e)) = c.close() {
                    error!("Error closing SQLite connection for {:?}: {:?}", db_path, e);
                } else {
                    debug!("SQLite connection closed successfully for {:?}", db_path);
                }
            }
            info!("SQLite blocking task for DB: {:?} finished.", db_path);
        });

        SqliteSink {
            path,
            table,
            command_sender,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn request<T>(
        &self,
        command: SqliteCommand,
        rx: oneshot::Receiver<T>,
        what: &str,
    ) -> Result<T, PipelineError> {
        self.command_sender
            .send(command)
            .await
            .map_err(|e| PipelineError::Other(format!("Failed to send {} command: {}", what, e)))?;
        rx.await.map_err(|e| {
            PipelineError::Other(format!("Failed to receive {} response: {}", what, e))
        })
    }
}

fn open_sync(path: &Path, table: &str) -> Result<Connection, PipelineError> {
    sql::validate_identifier(table)?;
    fs_util::ensure_parent_dir(path)?;
    let conn = Connection::open(path)?;
    debug!("Successfully opened SQLite DB: {:?}", path);

    let ddl = sql::create_table(Dialect::Sqlite, table);
    debug!("Creating table '{}' with schema: {}", table, ddl);
    conn.execute(&ddl, [])?;
    Ok(conn)
}

fn upsert_sync(
    conn: &mut Connection,
    table: &str,
    values: Vec<FieldValue>,
) -> Result<(), PipelineError> {
    let statement = sql::upsert(Dialect::Sqlite, table);
    let mut stmt = conn.prepare_cached(&statement)?;
    let params: Vec<rusqlite::types::Value> = values.into_iter().map(Into::into).collect();
    trace!("Executing upsert with {} parameters", params.len());
    stmt.execute(params_from_iter(params))?;
    Ok(())
}

#[async_trait]
impl Sink for SqliteSink {
    fn name(&self) -> &str {
        "SqliteSink"
    }

    async fn open(&self) -> Result<(), PipelineError> {
        let (tx, rx) = oneshot::channel();
        self.request(SqliteCommand::Open(tx), rx, "Open").await??;
        info!("SqliteSink ready: {:?} table {}", self.path, self.table);
        Ok(())
    }

    async fn upsert(&self, record: &Record) -> Result<(), PipelineError> {
        let (tx, rx) = oneshot::channel();
        let command = SqliteCommand::Upsert {
            values: record.column_values().into(),
            responder: tx,
        };
        self.request(command, rx, "Upsert").await?
    }

    async fn close(&self) -> Result<(), PipelineError> {
        debug!("Initiating SqliteSink shutdown.");
        let (tx, rx) = oneshot::channel();
        self.request(SqliteCommand::Shutdown(tx), rx, "Shutdown").await?;
        info!("SqliteSink closed successfully.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, text: &str, likes: i64) -> Record {
        Record {
            id: id.into(),
            bid: "Nabc".into(),
            user_id: "42".into(),
            username: "云朵".into(),
            text: text.into(),
            created_at: "2025-12-17 10:00".into(),
            source: "黄霄云超话".into(),
            pics: vec!["https://a/1.jpg".into()],
            attitudes_count: likes,
            keyword: "k".into(),
            ..Default::default()
        }
    }

    fn rows(path: &Path) -> Vec<(String, String, i64, String)> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("SELECT id, text, attitudes_count, pics FROM weibo ORDER BY id")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        rows
    }

    #[tokio::test]
    async fn double_dispatch_keeps_one_row_with_latest_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("weibo.db");
        let sink = SqliteSink::new(&path, "weibo");
        sink.open().await.unwrap();

        sink.upsert(&record("1", "first", 3)).await.unwrap();
        sink.upsert(&record("1", "second", 9)).await.unwrap();
        sink.upsert(&record("2", "other", 1)).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(
            rows(&path),
            vec![
                ("1".to_string(), "second".to_string(), 9, "https://a/1.jpg".to_string()),
                ("2".to_string(), "other".to_string(), 1, "https://a/1.jpg".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn identical_redelivery_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weibo.db");
        let sink = SqliteSink::new(&path, "weibo");
        sink.open().await.unwrap();
        sink.upsert(&record("1", "same", 3)).await.unwrap();
        let before = rows(&path);
        sink.upsert(&record("1", "same", 3)).await.unwrap();
        assert_eq!(rows(&path), before);
    }

    #[tokio::test]
    async fn reopening_keeps_existing_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weibo.db");
        {
            let sink = SqliteSink::new(&path, "weibo");
            sink.open().await.unwrap();
            sink.upsert(&record("1", "kept", 1)).await.unwrap();
            sink.close().await.unwrap();
        }
        let sink = SqliteSink::new(&path, "weibo");
        sink.open().await.unwrap();
        sink.upsert(&record("2", "new", 1)).await.unwrap();
        assert_eq!(rows(&path).len(), 2);
    }

    #[tokio::test]
    async fn upsert_before_open_fails() {
        let dir = TempDir::new().unwrap();
        let sink = SqliteSink::new(dir.path().join("weibo.db"), "weibo");
        assert!(sink.upsert(&record("1", "x", 0)).await.is_err());
    }

    #[tokio::test]
    async fn bad_table_name_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let sink = SqliteSink::new(dir.path().join("weibo.db"), "weibo; --");
        assert!(matches!(sink.open().await, Err(PipelineError::Config(_))));
    }
}
