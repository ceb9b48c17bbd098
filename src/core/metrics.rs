use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// 執行期間的計數器，所有欄位共用同一把鎖
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingMetrics {
    pub processed: u64,
    pub success: u64,
    pub errors: u64,
    pub validation_errors: u64,
    pub filtered: u64,
    pub skipped: u64,
    pub retries: u64,
    pub batches: u64,
    pub batch_total_ms: u64,
    pub min_batch_ms: Option<u64>,
    pub max_batch_ms: u64,
    pub response_count: u64,
    pub response_total_ms: u64,
    pub min_response_ms: Option<u64>,
    pub max_response_ms: u64,
    pub status_codes: BTreeMap<u16, u64>,
}

impl ProcessingMetrics {
    pub fn avg_response_ms(&self) -> f64 {
        if self.response_count == 0 {
            0.0
        } else {
            self.response_total_ms as f64 / self.response_count as f64
        }
    }

    pub fn avg_batch_ms(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.batch_total_ms as f64 / self.batches as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<ProcessingMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 從檢查點恢復時帶入先前的計數
    pub fn restore(&self, processed: u64, success: u64, errors: u64) {
        let mut m = self.lock();
        m.processed = processed;
        m.success = success;
        m.errors = errors;
    }

    fn lock(&self) -> MutexGuard<'_, ProcessingMetrics> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_success(&self) {
        let mut m = self.lock();
        m.processed += 1;
        m.success += 1;
    }

    pub fn record_error(&self) {
        let mut m = self.lock();
        m.processed += 1;
        m.errors += 1;
    }

    pub fn record_validation_error(&self) {
        let mut m = self.lock();
        m.processed += 1;
        m.errors += 1;
        m.validation_errors += 1;
    }

    pub fn record_filtered(&self) {
        self.lock().filtered += 1;
    }

    pub fn record_skipped(&self, count: u64) {
        self.lock().skipped += count;
    }

    pub fn record_retry(&self) {
        self.lock().retries += 1;
    }

    /// 一整批（含重試）從送出到全部完成的時間
    pub fn record_batch(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let mut m = self.lock();
        m.batches += 1;
        m.batch_total_ms += ms;
        m.min_batch_ms = Some(m.min_batch_ms.map_or(ms, |min| min.min(ms)));
        m.max_batch_ms = m.max_batch_ms.max(ms);
    }

    pub fn record_response(&self, elapsed: Duration, status: u16) {
        let ms = elapsed.as_millis() as u64;
        let mut m = self.lock();
        m.response_count += 1;
        m.response_total_ms += ms;
        m.min_response_ms = Some(m.min_response_ms.map_or(ms, |min| min.min(ms)));
        m.max_response_ms = m.max_response_ms.max(ms);
        *m.status_codes.entry(status).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> ProcessingMetrics {
        self.lock().clone()
    }
}
