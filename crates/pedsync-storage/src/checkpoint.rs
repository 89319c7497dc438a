use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("reading checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("checkpoint {path} holds an unreadable timestamp {content:?}")]
    Corrupt { path: PathBuf, content: String },
    #[error("writing checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// High-water mark of the last completed incremental run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` means no run has completed yet.
    async fn read(&self) -> Result<Option<DateTime<Utc>>, CheckpointError>;

    /// Replaces the stored value.
    async fn write(&self, at: DateTime<Utc>) -> Result<(), CheckpointError>;
}

/// Checkpoint kept as one RFC 3339 line in a file, replaced by temp-file rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn read(&self) -> Result<Option<DateTime<Utc>>, CheckpointError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        DateTime::parse_from_rfc3339(content.trim())
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| CheckpointError::Corrupt {
                path: self.path.clone(),
                content,
            })
    }

    async fn write(&self, at: DateTime<Utc>) -> Result<(), CheckpointError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| self.write_error(e))?;

        // Full precision so the stored mark is never earlier than `at`.
        let body = format!("{}\n", at.to_rfc3339_opts(SecondsFormat::AutoSi, true));
        let temp_path = dir.join(format!(".checkpoint.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| self.write_error(e))?;
        let written = async {
            file.write_all(body.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.write_error(err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.write_error(err));
        }
        Ok(())
    }
}
