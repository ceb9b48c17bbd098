use crate::config::Endpoint;
use crate::utils::error::{EtlError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// 續傳用的進度檔內容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub execution_id: String,
    pub last_processed_line: u64,
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_update: DateTime<Utc>,
    pub execution_start_time: DateTime<Utc>,
    #[serde(default)]
    pub configuration: Option<ConfigurationSnapshot>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSnapshot>,
}

impl Checkpoint {
    pub fn new(execution_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            execution_id: execution_id.into(),
            last_processed_line: 0,
            total_processed: 0,
            success_count: 0,
            error_count: 0,
            last_update: start_time,
            execution_start_time: start_time,
            configuration: None,
            endpoints: Vec::new(),
        }
    }

    /// 續傳時第一個要處理的行號
    pub fn resume_line(&self) -> u64 {
        self.last_processed_line + 1
    }
}

/// 執行參數快照，只供人工查看，載入時不會檢查
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSnapshot {
    pub input_path: String,
    pub config_path: Option<String>,
    pub batch_lines: usize,
    pub delimiter: String,
    pub start_line: u64,
    pub max_lines: Option<u64>,
    pub dry_run: bool,
    pub verbose: bool,
    pub endpoint_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub name: String,
    pub url: String,
    pub method: String,
    pub timeout_seconds: u64,
    pub mapping_count: usize,
}

impl From<&Endpoint> for EndpointSnapshot {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            name: endpoint.name.clone(),
            url: endpoint.url.clone(),
            method: endpoint.method.as_str().to_string(),
            timeout_seconds: endpoint.timeout_seconds,
            mapping_count: endpoint.mapping.len(),
        }
    }
}

/// 進度檔的讀寫，一個執行對應一個檔案
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 檔案不存在或內容損毀都視為沒有進度，只記錄警告
    pub fn load(&self) -> Option<Checkpoint> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No checkpoint at {}", self.path.display());
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ Could not read checkpoint {}: {}",
                    self.path.display(),
                    e
                );
                return None;
            }
        };

        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) => {
                tracing::info!(
                    "📍 Loaded checkpoint {}: line {}, processed {}",
                    self.path.display(),
                    checkpoint.last_processed_line,
                    checkpoint.total_processed
                );
                Some(checkpoint)
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ Ignoring corrupt checkpoint {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// 先寫暫存檔、同步後再改名
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let persistence = |source: std::io::Error| EtlError::PersistenceError {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(persistence)?;
        }

        let json = serde_json::to_vec_pretty(checkpoint)?;
        let tmp_path = self.tmp_path();

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(persistence)?;
        file.write_all(&json).await.map_err(persistence)?;
        file.sync_all().await.map_err(persistence)?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(persistence)?;

        tracing::debug!(
            "💾 Checkpoint saved: line {}, processed {}",
            checkpoint.last_processed_line,
            checkpoint.total_processed
        );
        Ok(())
    }

    /// 回傳是否真的刪除了檔案
    pub fn delete(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!("🗑️ Checkpoint {} removed", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(EtlError::PersistenceError {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
