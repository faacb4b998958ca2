//! Deterministic storage paths for the media attached to a record.
//!
//! Paths have the form `<root>/<keyword>/images/<id>[-<n>]<ext>` and
//! `<root>/<keyword>/videos/<id>.mp4`, where `<keyword>` is the same directory
//! the CSV sink uses ([`fs_util::keyword_dir`]). Downloading is someone else's job: the
//! pipeline hands each [`MediaRequest`] to a [`MediaFetcher`] if one is
//! configured.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use url::Url;

use crate::error::PipelineError;
use crate::fs_util;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// One file to fetch and where to save it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub kind: MediaKind,
    pub url: String,
    pub path: PathBuf,
}

/// Downloads media to the paths chosen by [`MediaPathResolver`].
#[async_trait]
pub trait MediaFetcher: Send + Sync + 'static {
    async fn fetch(&self, request: &MediaRequest) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone)]
pub struct MediaPathResolver {
    root: PathBuf,
}

impl MediaPathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        MediaPathResolver { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths for every picture of `record`, then its video if it has one.
    pub fn resolve(&self, record: &Record) -> Vec<MediaRequest> {
        let base = self.root.join(fs_util::keyword_dir(&record.keyword));
        let single = record.pics.len() == 1;

        let mut requests: Vec<MediaRequest> = record
            .pics
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let suffix = if single { String::new() } else { format!("-{}", i) };
                let file_name = format!("{}{}{}", record.id, suffix, url_extension(url));
                MediaRequest {
                    kind: MediaKind::Image,
                    url: url.clone(),
                    path: base.join("images").join(file_name),
                }
            })
            .collect();

        if let Some(video) = record.video_url.as_deref().filter(|v| !v.is_empty()) {
            requests.push(MediaRequest {
                kind: MediaKind::Video,
                url: video.to_string(),
                path: base.join("videos").join(format!("{}.mp4", record.id)),
            });
        }
        requests
    }
}

/// The extension (with its dot) of the last path segment of `url`, or "".
fn url_extension(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        // Not absolute; strip query and fragment by hand.
        Err(_) => url
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let segment = path.rsplit('/').next().unwrap_or_default();
    match segment.rfind('.') {
        Some(dot) => segment[dot..].to_string(),
        None => String::new(),
    }
}
