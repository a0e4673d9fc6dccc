//! JSONL audit sink.
//!
//! Storage path: `<base_dir>/{day}/audit-{datetime}.jsonl`, rotated daily.
//! Each append is flushed and fsynced before returning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{AuditQuery, AuditSink};
use crate::error::{CoreError, CoreResult};
use crate::models::audit::AuditEvent;

#[derive(Clone)]
pub struct JsonlAuditSink {
    base_dir: PathBuf,
    /// Held for the whole append so lines never interleave
    current_file: Arc<Mutex<Option<CurrentFile>>>,
}

struct CurrentFile {
    date: String,
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            current_file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn file_path(&self, current: &mut Option<CurrentFile>, date: &str) -> CoreResult<PathBuf> {
        if let Some(ref cf) = *current {
            if cf.date == date {
                return Ok(cf.path.clone());
            }
        }

        let day_dir = self.base_dir.join(date);
        fs::create_dir_all(&day_dir)
            .await
            .map_err(|e| CoreError::Audit(format!("Failed to create audit dir: {}", e)))?;

        let datetime = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let path = day_dir.join(format!("audit-{}.jsonl", datetime));
        *current = Some(CurrentFile {
            date: date.to_string(),
            path: path.clone(),
        });
        Ok(path)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, event: &AuditEvent) -> CoreResult<()> {
        let mut line = serde_json::to_string(event)
            .map_err(|e| CoreError::Audit(format!("Failed to serialize audit event: {}", e)))?;
        line.push('\n');

        let mut current = self.current_file.lock().await;
        let today = Local::now().format("%Y-%m-%d").to_string();
        let path = self.file_path(&mut current, &today).await?;

        let io = |e: std::io::Error| CoreError::Audit(format!("{}: {}", path.display(), e));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io)?;
        file.write_all(line.as_bytes()).await.map_err(io)?;
        file.flush().await.map_err(io)?;
        file.sync_data().await.map_err(io)?;
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> CoreResult<Vec<AuditEvent>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let mut day_dirs = collect_entries(&self.base_dir, |p| p.is_dir()).await?;
        day_dirs.sort_by(|a, b| b.cmp(a));

        for day_dir in day_dirs {
            let mut files = collect_entries(&day_dir, |p| {
                p.is_file() && p.extension().is_some_and(|ext| ext == "jsonl")
            })
            .await?;
            files.sort_by(|a, b| b.cmp(a));

            for file in files {
                let content = fs::read_to_string(&file)
                    .await
                    .map_err(|e| CoreError::Audit(format!("Failed to read audit file: {}", e)))?;
                for line in content.lines() {
                    match serde_json::from_str::<AuditEvent>(line) {
                        Ok(event) if query.matches(&event) => events.push(event),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("[Audit] Skipping malformed line in {}: {}", file.display(), e)
                        }
                    }
                }
            }
        }

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}

async fn collect_entries(path: &Path, keep: impl Fn(&Path) -> bool) -> CoreResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut readdir = fs::read_dir(path)
        .await
        .map_err(|e| CoreError::Audit(format!("Failed to read directory: {}", e)))?;
    while let Some(entry) = readdir
        .next_entry()
        .await
        .map_err(|e| CoreError::Audit(format!("Failed to read dir entry: {}", e)))?
    {
        let p = entry.path();
        if keep(&p) {
            out.push(p);
        }
    }
    Ok(out)
}
