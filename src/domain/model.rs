use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// 輸入檔的欄位名稱，依出現順序保存
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Header {
    pub fn new(names: Vec<String>) -> Self {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { names, index }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// 一筆輸入資料，讀取後不可變
#[derive(Debug, Clone)]
pub struct Record {
    line_number: u64,
    header: Arc<Header>,
    values: Vec<String>,
}

impl Record {
    /// 欄位數不足時補空字串，多出的欄位忽略
    pub fn new(line_number: u64, header: Arc<Header>, mut values: Vec<String>) -> Self {
        values.resize(header.len(), String::new());
        Self {
            line_number,
            header,
            values,
        }
    }

    /// 從欄位名稱與值的配對建立記錄，主要給測試與工具使用
    pub fn from_pairs(line_number: u64, pairs: &[(&str, &str)]) -> Self {
        let header = Header::new(pairs.iter().map(|(k, _)| k.to_string()).collect());
        let values = pairs.iter().map(|(_, v)| v.to_string()).collect();
        Self::new(line_number, Arc::new(header), values)
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.header
            .position(column)
            .map(|i| self.values[i].as_str())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// 依欄位順序列出 (名稱, 值)
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.header
            .names()
            .iter()
            .zip(self.values.iter())
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// 單筆記錄的派送結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { status: Option<u16>, attempts: u32 },
    Failure {
        status: Option<u16>,
        message: String,
        attempts: u32,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Success { attempts, .. } | Outcome::Failure { attempts, .. } => *attempts,
        }
    }
}

/// 單次執行產生的檔案位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPaths {
    pub execution_id: String,
    pub checkpoint_path: PathBuf,
    pub log_path: PathBuf,
}

/// 執行結束時回報的摘要
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub execution_id: String,
    pub total_lines: u64,
    pub processed: u64,
    pub success: u64,
    pub errors: u64,
    pub validation_errors: u64,
    pub filtered: u64,
    pub skipped: u64,
    pub retries: u64,
    pub batches: u64,
    pub min_batch_ms: Option<u64>,
    pub avg_batch_ms: f64,
    pub max_batch_ms: u64,
    pub last_processed_line: u64,
    pub min_response_ms: Option<u64>,
    pub avg_response_ms: f64,
    pub max_response_ms: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub elapsed_seconds: f64,
    pub cancelled: bool,
    pub checkpoint_path: PathBuf,
    pub log_path: PathBuf,
}
