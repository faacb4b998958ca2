//! Sink for persisting records to a MySQL server.
//!
//! On open the database (utf8mb4) and table are created if missing, then a
//! connection pool bound to that database is kept for the rest of the run.
//! Records are written with `INSERT ... ON DUPLICATE KEY UPDATE`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{ConnectOptions, Connection, Executor};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::sql::{self, Dialect};
use super::Sink;
use crate::config::MysqlSinkConfig;
use crate::error::PipelineError;
use crate::record::{FieldValue, Record};

pub struct MysqlSink {
    config: MysqlSinkConfig,
    pool: OnceCell<MySqlPool>,
    upsert_sql: String,
}

impl MysqlSink {
    pub fn new(config: MysqlSinkConfig) -> Self {
        info!(
            "Initializing MysqlSink for {}:{}/{}",
            config.host, config.port, config.database
        );
        let upsert_sql = sql::upsert(Dialect::Mysql, &config.table);
        MysqlSink {
            config,
            pool: OnceCell::new(),
            upsert_sql,
        }
    }

    fn server_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .password(&self.config.password)
            .charset("utf8mb4")
    }

    async fn create_database(&self) -> Result<(), PipelineError> {
        let mut conn = self.server_options().connect().await?;
        let ddl = format!(
            "CREATE DATABASE IF NOT EXISTS `{}` DEFAULT CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
            self.config.database
        );
        (&mut conn).execute(ddl.as_str()).await?;
        conn.close().await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for MysqlSink {
    fn name(&self) -> &str {
        "MysqlSink"
    }

    async fn open(&self) -> Result<(), PipelineError> {
        sql::validate_identifier(&self.config.database)?;
        sql::validate_identifier(&self.config.table)?;

        self.create_database().await?;

        let pool = MySqlPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .connect_with(self.server_options().database(&self.config.database))
            .await?;

        let ddl = sql::create_table(Dialect::Mysql, &self.config.table);
        debug!("Creating table '{}' with schema: {}", self.config.table, ddl);
        (&pool).execute(ddl.as_str()).await?;

        self.pool
            .set(pool)
            .map_err(|_| PipelineError::Other("MysqlSink opened twice".to_string()))?;
        info!("MysqlSink ready: database {}", self.config.database);
        Ok(())
    }

    async fn upsert(&self, record: &Record) -> Result<(), PipelineError> {
        let pool = self
            .pool
            .get()
            .ok_or_else(|| PipelineError::Other("MySQL pool is not open".to_string()))?;

        let mut query = sqlx::query(&self.upsert_sql);
        for value in record.column_values() {
            query = match value {
                FieldValue::Text(s) => query.bind(s),
                FieldValue::Integer(n) => query.bind(n),
            };
        }
        query.execute(pool).await?;
        debug!("Record {} upserted into MySQL", record.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), PipelineError> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            info!("MysqlSink closed.");
        }
        Ok(())
    }
}
