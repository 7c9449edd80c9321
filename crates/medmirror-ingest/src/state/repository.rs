// State persistence backends

use super::DownloadState;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Storage contract for the download state document
///
/// `save` must be durable when it returns: the tracker calls it after every
/// mutation and a crash immediately afterwards must not lose the write.
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Read the current document, or an empty one if none was saved yet
    async fn load(&self) -> Result<DownloadState>;

    async fn save(&self, state: &DownloadState) -> Result<()>;
}

/// JSON document on the local filesystem
///
/// Writes go to a sibling temp file which is fsynced and renamed over the
/// target, so a reader sees either the old or the new document.
pub struct FileStateRepository {
    path: PathBuf,
}

impl FileStateRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "download_state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateRepository for FileStateRepository {
    async fn load(&self) -> Result<DownloadState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(DownloadState::default()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                IngestError::state(format!(
                    "Corrupt state file {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DownloadState::default()),
            Err(e) => Err(IngestError::state(format!(
                "Cannot read state file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, state: &DownloadState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.temp_path();

        let write = async {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        };

        write.await.map_err(|e| {
            IngestError::state(format!(
                "Cannot write state file {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Single-row `jsonb` document in the `download_state` table
pub struct PgStateRepository {
    pool: PgPool,
}

impl PgStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateRepository for PgStateRepository {
    async fn load(&self) -> Result<DownloadState> {
        let document: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT document FROM download_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| IngestError::state(format!("Cannot read download_state: {}", e)))?;

        match document {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| IngestError::state(format!("Corrupt download_state row: {}", e))),
            None => Ok(DownloadState::default()),
        }
    }

    async fn save(&self, state: &DownloadState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO download_state (id, document, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id)
            DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()
            "#,
        )
        .bind(serde_json::to_value(state)?)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::state(format!("Cannot write download_state: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::Source;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_repository_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path().join("state.json"));
        assert_eq!(repo.load().await.unwrap(), DownloadState::default());
    }

    #[tokio::test]
    async fn test_file_repository_round_trip() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path().join("nested/state.json"));

        let mut state = DownloadState::default();
        state.retry_after.insert(Source::ClinicalTrials, Utc::now());
        repo.save(&state).await.unwrap();

        assert_eq!(repo.load().await.unwrap(), state);
        assert!(!repo.temp_path().exists());
    }

    #[tokio::test]
    async fn test_file_repository_corrupt_document_is_state_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = FileStateRepository::new(&path).load().await.unwrap_err();
        assert!(matches!(err, IngestError::State(_)));
    }
}
