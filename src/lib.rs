//! # weibo-pipeline
//!
//! Item pipeline for crawled Weibo posts.
//!
//! Records coming from the crawler are deduplicated, filtered by source and
//! content, merged into a latest-post-per-user file, and upserted into every
//! configured storage sink.
//!
//! ## Example
//!
//! ```rust,ignore
//! use weibo_pipeline::config::PipelineConfig;
//! use weibo_pipeline::pipeline::Pipeline;
//!
//! let config = PipelineConfig::from_json_file("pipeline.json")?;
//! let pipeline = Pipeline::from_config(&config).await?;
//! let report = pipeline.run(records).await;
//! std::process::exit(report.exit_code());
//! ```

// Core
pub mod config;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod stage;

// Stages
pub mod content_filter;
pub mod deduplication;

// Storage (drivers are feature-gated inside `sink`)
pub mod fs_util;
pub mod latest_store;
pub mod media;
pub mod sink;
pub mod text;

pub use config::PipelineConfig;
pub use error::{FailureKind, PipelineError};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineOutcome, PipelineReport, PipelineStats};
pub use record::{FilteredRecord, Record};
pub use stage::{DropReason, Stage, StageOutcome, StopReason};
