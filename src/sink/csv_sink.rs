//! Sink for exporting records to per-keyword CSV files.
//!
//! Each record goes to `<root>/<keyword>/<keyword>.csv`. A file starts with a
//! UTF-8 byte-order mark and the fixed header row, so spreadsheet tools open
//! the Chinese headers correctly. A row is appended at most once per record
//! id: ids already present in a file (from this run or an earlier one) are
//! skipped.
//!
//! All file I/O happens on a dedicated task fed through a command channel;
//! every append stages the whole file in a temporary sibling and renames it
//! into place.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use csv::{ReaderBuilder, Writer};
use kanal::unbounded_async;
use tracing::{debug, error, info};

use super::Sink;
use crate::error::PipelineError;
use crate::fs_util;
use crate::record::{header_row, Record};

const BOM: &[u8] = b"\xEF\xBB\xBF";

enum CsvCommand {
    Write {
        keyword: String,
        id: String,
        row: Vec<String>,
        responder: kanal::AsyncSender<Result<(), PipelineError>>,
    },
    Shutdown(kanal::AsyncSender<()>),
}

/// A sink that appends records to one CSV file per search keyword.
pub struct CsvSink {
    root: PathBuf,
    command_sender: kanal::AsyncSender<CsvCommand>,
}

impl CsvSink {
    /// Creates a new `CsvSink` writing below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!("Initializing CsvSink under {:?}", root);

        let (command_sender, command_receiver) = unbounded_async::<CsvCommand>();
        let task_root = root.clone();

        tokio::task::spawn(async move {
            // Ids already written, per file; loaded from disk on first touch.
            let mut written: HashMap<PathBuf, HashSet<String>> = HashMap::new();
            debug!("CSV task started for {:?}", task_root);

            while let Ok(command) = command_receiver.recv().await {
                match command {
                    CsvCommand::Write {
                        keyword,
                        id,
                        row,
                        responder,
                    } => {
                        let path = file_path(&task_root, &keyword);
                        let result = append_row(&mut written, &path, &id, &row);
                        if responder.send(result).await.is_err() {
                            error!("Failed to send CSV write response.");
                        }
                    }
                    CsvCommand::Shutdown(responder) => {
                        debug!("CSV task received shutdown command.");
                        let _ = responder.send(()).await;
                        break;
                    }
                }
            }
            info!("CSV task for {:?} finished.", task_root);
        });

        CsvSink {
            root,
            command_sender,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// `<root>/<keyword>/<keyword>.csv`, with the keyword reduced by
/// [`fs_util::keyword_dir`]. The file is named after its last component.
pub fn file_path(root: &Path, keyword: &str) -> PathBuf {
    let dir = fs_util::keyword_dir(keyword);
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fs_util::FALLBACK_KEYWORD.to_string());
    root.join(&dir).join(format!("{}.csv", name))
}

fn append_row(
    written: &mut HashMap<PathBuf, HashSet<String>>,
    path: &Path,
    id: &str,
    row: &[String],
) -> Result<(), PipelineError> {
    if !written.contains_key(path) {
        let ids = read_ids(path)?;
        written.insert(path.to_path_buf(), ids);
    }
    let ids = written
        .get_mut(path)
        .ok_or_else(|| PipelineError::Other("CSV id index missing".to_string()))?;
    if ids.contains(id) {
        debug!("Record {} already in {:?}, skipping.", id, path);
        return Ok(());
    }

    let is_new_file = !path.exists();
    let mut writer = Writer::from_writer(Vec::new());
    if is_new_file {
        writer.write_record(header_row())?;
    }
    writer.write_record(row)?;
    let rows = writer
        .into_inner()
        .map_err(|e| PipelineError::Other(format!("Failed to flush CSV row: {}", e)))?;

    fs_util::replace_file(path, true, |out: &mut dyn Write| {
        if is_new_file {
            out.write_all(BOM)?;
        }
        out.write_all(&rows)
    })?;

    ids.insert(id.to_string());
    Ok(())
}

fn read_ids(path: &Path) -> Result<HashSet<String>, PipelineError> {
    let mut ids = HashSet::new();
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);
    for row in reader.records() {
        if let Some(id) = row?.get(0) {
            ids.insert(id.to_string());
        }
    }
    debug!("Loaded {} existing ids from {:?}", ids.len(), path);
    Ok(ids)
}

#[async_trait]
impl Sink for CsvSink {
    fn name(&self) -> &str {
        "CsvSink"
    }

    async fn open(&self) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn upsert(&self, record: &Record) -> Result<(), PipelineError> {
        let row = record.column_values().iter().map(|v| v.to_cell()).collect();

        let (tx, rx) = kanal::unbounded_async();
        self.command_sender
            .send(CsvCommand::Write {
                keyword: record.keyword.clone(),
                id: record.id.clone(),
                row,
                responder: tx,
            })
            .await
            .map_err(|e| PipelineError::Other(format!("Failed to send Write command: {}", e)))?;

        rx.recv().await.map_err(|e| {
            PipelineError::Other(format!("Failed to receive Write response: {}", e))
        })?
    }

    async fn close(&self) -> Result<(), PipelineError> {
        info!("Closing CsvSink.");
        let (tx, rx) = kanal::unbounded_async();
        self.command_sender
            .send(CsvCommand::Shutdown(tx))
            .await
            .map_err(|e| PipelineError::Other(format!("Failed to send Shutdown command: {}", e)))?;
        rx.recv().await.map_err(|e| {
            PipelineError::Other(format!("Failed to receive shutdown response: {}", e))
        })?;
        Ok(())
    }
}
