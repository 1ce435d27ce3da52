//! Watched document directory producer.
//!
//! Scans a root directory (walkdir + globset include/exclude patterns) on
//! every poll and emits:
//!
//! - `document` records for files that are new or whose content hash
//!   changed since the last poll, carrying the previous chunk count so the
//!   normalizer can tombstone chunks that no longer exist;
//! - `document_removed` records for files that disappeared.
//!
//! Unchanged files emit nothing. The first poll after startup reports every
//! file; the sequencer drops the ones already indexed as duplicates.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use fintech_rag_core::chunk::chunk_text;
use fintech_rag_core::normalize::SourceRecord;

use crate::config::DocumentSourceConfig;
use crate::traits::Producer;

/// What the producer remembers about an emitted file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Seen {
    hash: String,
    chunks: usize,
}

/// A file found by one scan.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Path relative to the root, `/`-separated.
    pub path: String,
    pub text: String,
    pub modified_at: DateTime<Utc>,
}

pub struct DocumentProducer {
    name: String,
    description: String,
    config: DocumentSourceConfig,
    include: GlobSet,
    exclude: GlobSet,
    chunk_max_tokens: usize,
    seen: Mutex<HashMap<String, Seen>>,
}

impl DocumentProducer {
    pub fn new(name: String, config: DocumentSourceConfig, chunk_max_tokens: usize) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&excludes)?;

        let description = format!("documents under {}", config.root.display());
        Ok(Self {
            name,
            description,
            config,
            include,
            exclude,
            chunk_max_tokens,
            seen: Mutex::new(HashMap::new()),
        })
    }

    /// Walk the root and read every matching file, sorted by path.
    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        let root = &self.config.root;
        if !root.exists() {
            bail!("Document source root does not exist: {}", root.display());
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            match read_file(path) {
                Ok((text, modified_at)) => files.push(ScannedFile {
                    path: rel_str,
                    text,
                    modified_at,
                }),
                Err(e) => {
                    tracing::warn!(source = %self.name, path = %rel_str, error = %e, "skipping unreadable document");
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Diff a scan against the previous one and update the remembered state.
    fn diff(&self, files: Vec<ScannedFile>) -> Vec<SourceRecord> {
        let mut seen = self.seen.lock();
        let mut records = Vec::new();
        let mut present = HashMap::with_capacity(files.len());

        for file in files {
            let hash = hex::encode(Sha256::digest(file.text.as_bytes()));
            let chunks = chunk_text(&file.text, self.chunk_max_tokens).len();
            let previous = seen.get(&file.path).cloned();
            if previous.as_ref().map(|s| s.hash.as_str()) != Some(hash.as_str()) {
                records.push(SourceRecord::Document {
                    path: file.path.clone(),
                    title: title_of(&file.path),
                    text: file.text,
                    modified_at: file.modified_at,
                    previous_chunks: previous.map(|s| s.chunks).unwrap_or(0),
                });
            }
            present.insert(file.path, Seen { hash, chunks });
        }

        let now = Utc::now();
        let mut removed: Vec<_> = seen
            .iter()
            .filter(|(path, _)| !present.contains_key(*path))
            .map(|(path, s)| SourceRecord::DocumentRemoved {
                path: path.clone(),
                chunk_count: s.chunks,
                removed_at: Some(now),
            })
            .collect();
        removed.sort_by(|a, b| record_path(a).cmp(record_path(b)));
        records.extend(removed);

        *seen = present;
        records
    }
}

#[async_trait]
impl Producer for DocumentProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> &str {
        "documents"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    async fn poll(&self) -> Result<Vec<SourceRecord>> {
        let files = self.scan()?;
        Ok(self.diff(files))
    }
}

fn read_file(path: &Path) -> Result<(String, DateTime<Utc>)> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let text = std::fs::read_to_string(path)?;
    Ok((text, modified))
}

fn title_of(path: &str) -> Option<String> {
    path.rsplit('/').next().map(|s| s.to_string())
}

fn record_path(record: &SourceRecord) -> &str {
    match record {
        SourceRecord::Document { path, .. } | SourceRecord::DocumentRemoved { path, .. } => path,
        _ => "",
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
