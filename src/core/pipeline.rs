use crate::config::{AppConfig, Endpoint};
use crate::core::checkpoint::{Checkpoint, CheckpointStore, ConfigurationSnapshot, EndpointSnapshot};
use crate::core::dispatch::{DispatchClient, EndpointRouter};
use crate::core::error_log::ErrorLog;
use crate::core::filter::RecordFilter;
use crate::core::metrics::MetricsRegistry;
use crate::core::source::RecordSource;
use crate::core::validator::RecordValidator;
use crate::domain::model::{ExecutionPaths, Outcome, Record, RunSummary};
use crate::domain::ports::Dispatcher;
use crate::utils::error::{EtlError, Result};
use crate::utils::monitor::SystemMonitor;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// 錯誤日誌中非 HTTP 失敗使用的代碼
const VALIDATION_ERROR_CODE: u16 = 400;
const TRANSPORT_ERROR_CODE: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Resuming,
    Reading,
    BatchFull,
    Dispatching,
    Checkpointing,
    Draining,
    Finalizing,
    Done,
}

/// 單次執行的選項，多半來自命令列
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub execution_id: Option<String>,
    pub endpoint_override: Option<String>,
    pub dry_run: bool,
    pub verbose: bool,
    pub monitor: bool,
    pub reset_checkpoint: bool,
    pub config_path: Option<PathBuf>,
}

/// 已完整處理的進度；只有整批派送完成後才會前進
#[derive(Debug, Clone, Copy, Default)]
struct Committed {
    line: u64,
    processed: u64,
    success: u64,
    errors: u64,
}

impl Committed {
    fn advance(&mut self, line: u64, metrics: &MetricsRegistry) {
        let snapshot = metrics.snapshot();
        self.line = self.line.max(line);
        self.processed = snapshot.processed;
        self.success = snapshot.success;
        self.errors = snapshot.errors;
    }
}

type Batch<'a> = Vec<(Record, &'a Endpoint)>;

/// 驗證或路由失敗的記錄
struct Rejection {
    record: Record,
    reason: String,
    failed_validation: bool,
}

/// 尚未送出的批次，以及排在它之後的拒絕記錄
///
/// 拒絕記錄在批次送出後才計數並寫入錯誤日誌；取消時與批次一起丟棄。
#[derive(Default)]
struct Pending<'a> {
    batch: Batch<'a>,
    held: Vec<Rejection>,
}

pub struct PipelineOrchestrator {
    config: AppConfig,
    options: RunOptions,
    paths: ExecutionPaths,
    router: EndpointRouter,
    filter: RecordFilter,
    validator: RecordValidator,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<MetricsRegistry>,
    checkpoints: CheckpointStore,
    cancel: CancellationToken,
    monitor: SystemMonitor,
}

impl PipelineOrchestrator {
    /// 以 HTTP 派送建立執行流程
    pub fn new(config: AppConfig, options: RunOptions) -> Result<Self> {
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Arc::new(DispatchClient::new(
            &config.endpoints,
            Arc::clone(&metrics),
            options.dry_run,
        )?);
        Self::with_dispatcher(config, options, dispatcher, metrics)
    }

    /// 端點解析、欄位規則都在這裡檢查，設定有誤時不會開始讀檔
    pub fn with_dispatcher(
        config: AppConfig,
        options: RunOptions,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let router = EndpointRouter::new(&config, options.endpoint_override.as_deref())?;
        let validator = RecordValidator::new(&config.file.columns)?;
        let filter = RecordFilter::from_columns(&config.file.columns);

        let execution_id = options
            .execution_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let paths = config.execution_paths(&execution_id);
        let checkpoints = CheckpointStore::new(&paths.checkpoint_path);
        let monitor = SystemMonitor::new(options.monitor);

        Ok(Self {
            config,
            options,
            paths,
            router,
            filter,
            validator,
            dispatcher,
            metrics,
            checkpoints,
            cancel: CancellationToken::new(),
            monitor,
        })
    }

    pub fn paths(&self) -> &ExecutionPaths {
        &self.paths
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// 取消後不再開始新批次，已送出的請求會等到完成
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_started = Instant::now();
        let mut state = PipelineState::Starting;

        tracing::info!("🚀 Starting execution {}", self.paths.execution_id);
        tracing::info!("📁 Input: {}", self.config.file.input_path);
        tracing::info!("🔍 {}", self.filter.summary());

        let delimiter = self.config.delimiter_byte()?;
        self.prepare_directories()?;

        if self.options.reset_checkpoint {
            self.checkpoints.delete()?;
        }

        transition(&mut state, PipelineState::Resuming);
        let resumed = self.checkpoints.load();
        let execution_start_time = resumed
            .as_ref()
            .map(|cp| cp.execution_start_time)
            .unwrap_or_else(Utc::now);
        let start_line = match &resumed {
            Some(cp) => {
                tracing::info!(
                    "♻️ Resuming {} from line {} ({} already processed)",
                    cp.execution_id,
                    cp.resume_line(),
                    cp.total_processed
                );
                self.metrics
                    .restore(cp.total_processed, cp.success_count, cp.error_count);
                cp.resume_line()
            }
            None => self.config.file.start_line,
        };

        let mut source = match RecordSource::open(&self.config.file.input_path, delimiter) {
            Ok(source) => source,
            Err(e) => {
                tracing::error!("❌ Cannot read input: {}", e);
                transition(&mut state, PipelineState::Finalizing);
                return Err(e);
            }
        };

        let total_lines = self.estimate_total_lines(delimiter);
        let error_log = ErrorLog::open(&self.paths.log_path, &source.header())?;

        let skipped = source.skip_to(start_line)?;
        if skipped > 0 {
            tracing::info!("⏭️ Skipped {} line(s) before line {}", skipped, start_line);
            self.metrics.record_skipped(skipped);
        }

        let mut committed = Committed::default();
        committed.advance(source.line_number(), &self.metrics);
        if let Some(cp) = &resumed {
            committed.line = committed.line.max(cp.last_processed_line);
        }

        let batch_size = self.config.file.batch_lines.max(1);
        let checkpoint_interval = Duration::from_secs(self.config.file.checkpoint_interval_seconds);
        let progress_interval = Duration::from_secs(self.config.file.progress_interval_seconds);
        let baseline_processed = self.metrics.snapshot().processed;

        let mut pending = Pending {
            batch: Vec::with_capacity(batch_size),
            held: Vec::new(),
        };
        let mut admitted: u64 = 0;
        let mut last_checkpoint = Instant::now();
        let mut last_progress = Instant::now();
        let mut cancelled = false;

        transition(&mut state, PipelineState::Reading);
        loop {
            if self.cancel.is_cancelled() {
                tracing::warn!(
                    "🛑 Cancellation requested, stopping before line {}",
                    source.line_number() + 1
                );
                if !pending.batch.is_empty() {
                    tracing::info!(
                        "{} pending and {} rejected record(s) will be picked up on resume",
                        pending.batch.len(),
                        pending.held.len()
                    );
                }
                cancelled = true;
                break;
            }

            if self.config.file.max_lines.is_some_and(|max| admitted >= max) {
                tracing::info!("🔢 Reached max_lines ({})", admitted);
                break;
            }

            let Some(record) = source.next_record()? else {
                break;
            };
            let line = record.line_number();

            if self.filter.passes_filters(&record) {
                admitted += 1;
                self.admit(record, &mut pending, &error_log);
            } else {
                self.metrics.record_filtered();
            }

            if pending.batch.is_empty() {
                committed.advance(line, &self.metrics);
                continue;
            }

            if pending.batch.len() >= batch_size {
                transition(&mut state, PipelineState::BatchFull);
                transition(&mut state, PipelineState::Dispatching);
                self.dispatch_batch(std::mem::take(&mut pending.batch), &error_log)
                    .await;
                self.settle(std::mem::take(&mut pending.held), &error_log);
                committed.advance(line, &self.metrics);

                if last_checkpoint.elapsed() >= checkpoint_interval {
                    transition(&mut state, PipelineState::Checkpointing);
                    let checkpoint = self.checkpoint(&committed, execution_start_time);
                    match self.checkpoints.save(&checkpoint).await {
                        Ok(()) => last_checkpoint = Instant::now(),
                        Err(e) => tracing::warn!("⚠️ Checkpoint save failed, will retry: {}", e),
                    }
                }

                if last_progress.elapsed() >= progress_interval {
                    self.log_progress(total_lines, baseline_processed, run_started);
                    last_progress = Instant::now();
                }

                transition(&mut state, PipelineState::Reading);
            }
        }

        if !cancelled {
            transition(&mut state, PipelineState::Draining);
            if !pending.batch.is_empty() {
                self.dispatch_batch(std::mem::take(&mut pending.batch), &error_log)
                    .await;
            }
            self.settle(std::mem::take(&mut pending.held), &error_log);
            committed.advance(source.line_number(), &self.metrics);
        }

        transition(&mut state, PipelineState::Finalizing);
        let checkpoint = self.checkpoint(&committed, execution_start_time);
        self.checkpoints.save(&checkpoint).await?;

        self.log_progress(total_lines, baseline_processed, run_started);
        self.monitor.log_final_stats();

        let summary = self.summary(total_lines, committed.line, cancelled, run_started);
        transition(&mut state, PipelineState::Done);
        tracing::info!(
            "🎉 Execution {} finished: {} processed, {} ok, {} failed",
            summary.execution_id,
            summary.processed,
            summary.success,
            summary.errors
        );
        Ok(summary)
    }

    fn prepare_directories(&self) -> Result<()> {
        let dirs = [
            self.paths.checkpoint_path.parent(),
            self.paths.log_path.parent(),
        ];
        for dir in dirs.into_iter().flatten().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| EtlError::PersistenceError {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    fn estimate_total_lines(&self, delimiter: u8) -> u64 {
        if let Some(max_lines) = self.config.file.max_lines {
            return max_lines;
        }
        match RecordSource::count_records(Path::new(&self.config.file.input_path), delimiter) {
            Ok(count) => {
                tracing::info!("📊 {} data line(s) in input", count);
                count
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not count input lines: {}", e);
                0
            }
        }
    }

    /// 驗證並決定端點；失敗的記錄不進入批次
    fn admit<'a>(&'a self, record: Record, pending: &mut Pending<'a>, error_log: &ErrorLog) {
        let rejection = if let Some(reason) = self.validator.validate_record(&record) {
            tracing::debug!("⚠️ line {} rejected: {}", record.line_number(), reason);
            Rejection {
                record,
                reason,
                failed_validation: true,
            }
        } else {
            match self.router.route(&record) {
                Ok(endpoint) => {
                    pending.batch.push((record, endpoint));
                    return;
                }
                Err(e) => {
                    tracing::warn!("⚠️ line {}: {}", record.line_number(), e);
                    Rejection {
                        record,
                        reason: e.to_string(),
                        failed_validation: false,
                    }
                }
            }
        };

        if pending.batch.is_empty() {
            self.reject(error_log, rejection);
        } else {
            pending.held.push(rejection);
        }
    }

    fn settle(&self, held: Vec<Rejection>, error_log: &ErrorLog) {
        for rejection in held {
            self.reject(error_log, rejection);
        }
    }

    fn reject(&self, error_log: &ErrorLog, rejection: Rejection) {
        if rejection.failed_validation {
            self.metrics.record_validation_error();
        } else {
            self.metrics.record_error();
        }
        self.write_error(
            error_log,
            &rejection.record,
            VALIDATION_ERROR_CODE,
            &rejection.reason,
        );
    }

    async fn dispatch_batch(&self, batch: Batch<'_>, error_log: &ErrorLog) {
        let first = batch.first().map(|(r, _)| r.line_number()).unwrap_or_default();
        let last = batch.last().map(|(r, _)| r.line_number()).unwrap_or_default();

        let started = Instant::now();
        let outcomes = futures::future::join_all(
            batch
                .iter()
                .map(|(record, endpoint)| self.dispatcher.dispatch(record, endpoint)),
        )
        .await;
        let elapsed = started.elapsed();

        let mut failed = 0;
        for ((record, endpoint), outcome) in batch.iter().zip(outcomes) {
            match outcome {
                Outcome::Success { .. } => self.metrics.record_success(),
                Outcome::Failure {
                    status,
                    message,
                    attempts,
                } => {
                    failed += 1;
                    self.metrics.record_error();
                    tracing::warn!(
                        "❌ line {} -> '{}' failed after {} attempt(s): {}",
                        record.line_number(),
                        endpoint.name,
                        attempts,
                        message
                    );
                    let code = status.unwrap_or(TRANSPORT_ERROR_CODE);
                    self.write_error(error_log, record, code, &message);
                }
            }
        }
        self.metrics.record_batch(elapsed);

        if failed > 0 {
            tracing::warn!(
                "📦 Lines {}-{}: {} sent, {} failed",
                first,
                last,
                batch.len() - failed,
                failed
            );
        } else {
            tracing::info!(
                "📦 Lines {}-{}: {} sent in {}ms",
                first,
                last,
                batch.len(),
                elapsed.as_millis()
            );
        }
    }

    fn write_error(&self, error_log: &ErrorLog, record: &Record, code: u16, message: &str) {
        if let Err(e) = error_log.append(record, code, message) {
            tracing::warn!(
                "⚠️ Could not write line {} to {}: {}",
                record.line_number(),
                error_log.path().display(),
                e
            );
        }
    }

    fn checkpoint(&self, committed: &Committed, started: DateTime<Utc>) -> Checkpoint {
        let file = &self.config.file;
        Checkpoint {
            execution_id: self.paths.execution_id.clone(),
            last_processed_line: committed.line,
            total_processed: committed.processed,
            success_count: committed.success,
            error_count: committed.errors,
            last_update: Utc::now(),
            execution_start_time: started,
            configuration: Some(ConfigurationSnapshot {
                input_path: file.input_path.clone(),
                config_path: self
                    .options
                    .config_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                batch_lines: file.batch_lines,
                delimiter: file.delimiter.clone(),
                start_line: file.start_line,
                max_lines: file.max_lines,
                dry_run: self.options.dry_run,
                verbose: self.options.verbose,
                endpoint_override: self.options.endpoint_override.clone(),
            }),
            endpoints: self
                .router
                .endpoints()
                .iter()
                .map(EndpointSnapshot::from)
                .collect(),
        }
    }

    fn log_progress(&self, total_lines: u64, baseline_processed: u64, started: Instant) {
        let m = self.metrics.snapshot();
        let elapsed = started.elapsed().as_secs_f64();
        let this_run = m.processed.saturating_sub(baseline_processed);
        let rate = if elapsed > 0.0 {
            this_run as f64 / elapsed
        } else {
            0.0
        };

        if total_lines > 0 {
            let percent = (m.processed as f64 / total_lines as f64 * 100.0).min(100.0);
            let remaining = total_lines.saturating_sub(m.processed);
            let eta = if rate > 0.0 {
                format!("{:.0}s", remaining as f64 / rate)
            } else {
                "unknown".to_string()
            };
            tracing::info!(
                "⏳ {}/{} ({:.1}%) | ok {} | failed {} | filtered {} | {:.1} rec/s | ETA {}",
                m.processed,
                total_lines,
                percent,
                m.success,
                m.errors,
                m.filtered,
                rate,
                eta
            );
        } else {
            tracing::info!(
                "⏳ {} processed | ok {} | failed {} | filtered {} | {:.1} rec/s",
                m.processed,
                m.success,
                m.errors,
                m.filtered,
                rate
            );
        }

        self.monitor.log_stats("Processing", this_run);
    }

    fn summary(
        &self,
        total_lines: u64,
        last_processed_line: u64,
        cancelled: bool,
        started: Instant,
    ) -> RunSummary {
        let m = self.metrics.snapshot();
        RunSummary {
            execution_id: self.paths.execution_id.clone(),
            total_lines,
            processed: m.processed,
            success: m.success,
            errors: m.errors,
            validation_errors: m.validation_errors,
            filtered: m.filtered,
            skipped: m.skipped,
            retries: m.retries,
            batches: m.batches,
            min_batch_ms: m.min_batch_ms,
            avg_batch_ms: m.avg_batch_ms(),
            max_batch_ms: m.max_batch_ms,
            last_processed_line,
            min_response_ms: m.min_response_ms,
            avg_response_ms: m.avg_response_ms(),
            max_response_ms: m.max_response_ms,
            status_codes: m.status_codes.clone(),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            cancelled,
            checkpoint_path: self.paths.checkpoint_path.clone(),
            log_path: self.paths.log_path.clone(),
        }
    }
}

fn transition(state: &mut PipelineState, next: PipelineState) {
    tracing::debug!("🔀 {:?} -> {:?}", state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Header;
    use async_trait::async_trait;
    use std::sync::{Mutex, OnceLock};
    use tempfile::TempDir;

    /// 記錄收到的行號，指定行號回傳失敗
    #[derive(Default)]
    struct RecordingDispatcher {
        lines: Mutex<Vec<u64>>,
        fail_lines: Vec<u64>,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(&self, record: &Record, _endpoint: &Endpoint) -> Outcome {
            self.lines.lock().unwrap().push(record.line_number());
            if self.fail_lines.contains(&record.line_number()) {
                Outcome::Failure {
                    status: Some(422),
                    message: "rejected".to_string(),
                    attempts: 1,
                }
            } else {
                Outcome::Success {
                    status: Some(200),
                    attempts: 1,
                }
            }
        }
    }

    /// 每次派送時讀取進度檔，記下 (行號, 當時檔案中的行號)
    struct CheckpointSpy {
        path: PathBuf,
        unblock_at: Option<u64>,
        seen: Mutex<Vec<(u64, Option<u64>)>>,
    }

    impl CheckpointSpy {
        fn new(path: PathBuf, unblock_at: Option<u64>) -> Self {
            Self {
                path,
                unblock_at,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Dispatcher for CheckpointSpy {
        async fn dispatch(&self, record: &Record, _endpoint: &Endpoint) -> Outcome {
            let line = record.line_number();
            if self.unblock_at.is_some_and(|at| line >= at) && self.path.is_dir() {
                std::fs::remove_dir(&self.path).unwrap();
            }
            let saved = CheckpointStore::new(&self.path)
                .load()
                .map(|cp| cp.last_processed_line);
            self.seen.lock().unwrap().push((line, saved));
            Outcome::Success {
                status: Some(200),
                attempts: 1,
            }
        }
    }

    /// 第一次派送時要求取消
    #[derive(Default)]
    struct CancellingDispatcher {
        token: OnceLock<CancellationToken>,
        lines: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Dispatcher for CancellingDispatcher {
        async fn dispatch(&self, record: &Record, _endpoint: &Endpoint) -> Outcome {
            if let Some(token) = self.token.get() {
                token.cancel();
            }
            self.lines.lock().unwrap().push(record.line_number());
            Outcome::Success {
                status: Some(201),
                attempts: 1,
            }
        }
    }

    fn write_input(dir: &TempDir, rows: usize) -> PathBuf {
        let path = dir.path().join("input.csv");
        let mut content = String::from("id,email,status\n");
        for i in 1..=rows {
            let status = if i % 3 == 0 { "skip" } else { "active" };
            content.push_str(&format!("{},user{}@x.com,{}\n", i, i, status));
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn config(dir: &TempDir, input: &Path, extra_file: &str) -> AppConfig {
        let toml = format!(
            r#"
[file]
input_path = "{input}"
batch_lines = 4
log_dir = "{logs}"
checkpoint_dir = "{cps}"
{extra_file}

[[file.columns]]
column = "status"

[[file.columns.filters]]
operator = "not_equals"
value = "skip"

[[endpoints]]
name = "crm"
url = "http://localhost:1/contacts"

[[endpoints.mapping]]
attribute = "id"
source_column = "id"
"#,
            input = input.display(),
            logs = dir.path().join("logs").display(),
            cps = dir.path().join("checkpoints").display(),
        );
        AppConfig::from_toml_str(&toml).unwrap()
    }

    fn orchestrator<D: Dispatcher + 'static>(
        config: AppConfig,
        execution_id: &str,
        dispatcher: Arc<D>,
    ) -> PipelineOrchestrator {
        let options = RunOptions {
            execution_id: Some(execution_id.to_string()),
            ..Default::default()
        };
        PipelineOrchestrator::with_dispatcher(
            config,
            options,
            dispatcher,
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_max_lines_counts_admitted_records_only() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 20);
        let cfg = config(&dir, &input, "max_lines = 5");
        let dispatcher = Arc::new(RecordingDispatcher::default());

        let summary = orchestrator(cfg, "max", Arc::clone(&dispatcher))
            .run()
            .await
            .unwrap();

        // 資料第 3、6 筆被過濾，需讀到第 7 筆（第 8 行）才湊滿 5 筆
        let mut lines = dispatcher.lines.lock().unwrap().clone();
        lines.sort_unstable();
        assert_eq!(lines, vec![2, 3, 5, 6, 8]);
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.filtered, 2);
        assert_eq!(summary.last_processed_line, 8);
    }

    #[tokio::test]
    async fn test_counts_and_error_log() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.csv");
        std::fs::write(&input, "id,email,status\n1,a@x.com,active\n2,bad,active\n3,c@x.com,active\n").unwrap();

        let mut cfg = config(&dir, &input, "");
        cfg.file.columns.push(crate::config::ColumnSpec {
            column: "email".to_string(),
            column_type: Default::default(),
            regex: Some(r"^[^@\s]+@[^@\s]+\.[^@\s]+$".to_string()),
            format: None,
            filters: Vec::new(),
        });

        let dispatcher = Arc::new(RecordingDispatcher {
            fail_lines: vec![4],
            ..Default::default()
        });
        let pipeline = orchestrator(cfg, "counts", dispatcher);
        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.validation_errors, 1);

        let log = std::fs::read_to_string(&pipeline.paths().log_path).unwrap();
        assert!(log.starts_with("LineNumber,id,email,status,HttpCode,ErrorMessage"));
        assert!(log.contains("3,2,bad,active,400,"));
        assert!(log.contains("4,3,c@x.com,active,422,rejected"));

        let checkpoint = CheckpointStore::new(&pipeline.paths().checkpoint_path)
            .load()
            .unwrap();
        assert_eq!(checkpoint.last_processed_line, 4);
        assert_eq!(checkpoint.total_processed, 3);
        assert_eq!(checkpoint.success_count + checkpoint.error_count, 3);
    }

    #[tokio::test]
    async fn test_resume_continues_after_checkpoint() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 10);
        let cfg = config(&dir, &input, "");

        let store = CheckpointStore::new(cfg.execution_paths("resume").checkpoint_path);
        let mut previous = Checkpoint::new("resume", Utc::now());
        previous.last_processed_line = 6;
        previous.total_processed = 4;
        previous.success_count = 3;
        previous.error_count = 1;
        store.save(&previous).await.unwrap();

        let dispatcher = Arc::new(RecordingDispatcher::default());
        let summary = orchestrator(cfg, "resume", Arc::clone(&dispatcher))
            .run()
            .await
            .unwrap();

        let mut lines = dispatcher.lines.lock().unwrap().clone();
        lines.sort_unstable();
        assert_eq!(lines, vec![8, 9, 11]);

        let saved = store.load().unwrap();
        assert_eq!(saved.execution_start_time, previous.execution_start_time);
        assert!(saved.last_processed_line >= previous.last_processed_line);
        assert!(
            saved.success_count + saved.error_count
                >= previous.success_count + previous.error_count
        );
        assert_eq!(saved.total_processed, 7);
        assert_eq!(summary.skipped, 5);
    }

    #[tokio::test]
    async fn test_cancelled_run_saves_checkpoint_without_dispatching() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 10);
        let cfg = config(&dir, &input, "");

        let dispatcher = Arc::new(RecordingDispatcher::default());
        let pipeline = orchestrator(cfg, "cancel", Arc::clone(&dispatcher));
        pipeline.cancellation_token().cancel();

        let summary = pipeline.run().await.unwrap();
        assert!(summary.cancelled);
        assert!(dispatcher.lines.lock().unwrap().is_empty());

        let saved = CheckpointStore::new(&pipeline.paths().checkpoint_path)
            .load()
            .unwrap();
        assert_eq!(saved.last_processed_line, 1);
        assert_eq!(saved.total_processed, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_batch_lets_it_finish() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 10);
        let cfg = config(&dir, &input, "");

        let dispatcher = Arc::new(CancellingDispatcher::default());
        let pipeline = orchestrator(cfg.clone(), "mid-cancel", Arc::clone(&dispatcher));
        dispatcher.token.set(pipeline.cancellation_token()).unwrap();

        let summary = pipeline.run().await.unwrap();

        // 第一批已開始，四筆都要送完，之後不再讀下一行
        let mut lines = dispatcher.lines.lock().unwrap().clone();
        lines.sort_unstable();
        assert_eq!(lines, vec![2, 3, 5, 6]);
        assert!(summary.cancelled);
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.success, 4);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.last_processed_line, 6);

        let saved = CheckpointStore::new(&pipeline.paths().checkpoint_path)
            .load()
            .unwrap();
        assert_eq!(saved.last_processed_line, 6);
        assert_eq!(saved.total_processed, 4);
        assert_eq!(saved.success_count, 4);

        let resumed = Arc::new(RecordingDispatcher::default());
        let summary = orchestrator(cfg, "mid-cancel", Arc::clone(&resumed))
            .run()
            .await
            .unwrap();
        let mut lines = resumed.lines.lock().unwrap().clone();
        lines.sort_unstable();
        assert_eq!(lines, vec![8, 9, 11]);
        assert_eq!(summary.processed, 7);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_checkpoint_saved_between_batches() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 12);
        let cfg = config(&dir, &input, "checkpoint_interval_seconds = 0");
        let path = cfg.execution_paths("cadence").checkpoint_path;

        let spy = Arc::new(CheckpointSpy::new(path.clone(), None));
        orchestrator(cfg, "cadence", Arc::clone(&spy))
            .run()
            .await
            .unwrap();

        let seen = spy.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (2, None),
                (3, None),
                (5, None),
                (6, None),
                (8, Some(6)),
                (9, Some(6)),
                (11, Some(6)),
                (12, Some(6)),
            ]
        );
        for (line, saved) in &seen {
            assert!(saved.unwrap_or(0) < *line);
        }
        assert_eq!(CheckpointStore::new(&path).load().unwrap().last_processed_line, 13);
    }

    #[tokio::test]
    async fn test_checkpoint_waits_for_interval() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 12);
        let cfg = config(&dir, &input, "checkpoint_interval_seconds = 3600");
        let path = cfg.execution_paths("quiet").checkpoint_path;

        let spy = Arc::new(CheckpointSpy::new(path.clone(), None));
        orchestrator(cfg, "quiet", Arc::clone(&spy))
            .run()
            .await
            .unwrap();

        let seen = spy.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|(_, saved)| saved.is_none()));
        assert_eq!(CheckpointStore::new(&path).load().unwrap().last_processed_line, 13);
    }

    #[tokio::test]
    async fn test_failed_checkpoint_save_is_retried_after_next_batch() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 20);
        let cfg = config(&dir, &input, "checkpoint_interval_seconds = 0");
        let path = cfg.execution_paths("blocked").checkpoint_path;

        // 進度檔位置被目錄佔用，第一次儲存必定失敗，第二批開始時才移除
        std::fs::create_dir_all(&path).unwrap();
        let spy = Arc::new(CheckpointSpy::new(path.clone(), Some(8)));
        let summary = orchestrator(cfg, "blocked", Arc::clone(&spy))
            .run()
            .await
            .unwrap();

        let seen = spy.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (2, None),
                (3, None),
                (5, None),
                (6, None),
                (8, None),
                (9, None),
                (11, None),
                (12, None),
                (14, Some(12)),
                (15, Some(12)),
                (17, Some(12)),
                (18, Some(12)),
                (20, Some(18)),
                (21, Some(18)),
            ]
        );
        assert_eq!(summary.success, 14);
        assert_eq!(summary.batches, 4);
        assert_eq!(CheckpointStore::new(&path).load().unwrap().last_processed_line, 21);
    }

    #[test]
    fn test_rejections_behind_pending_batch_are_held() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 1);
        let mut cfg = config(&dir, &input, "");
        cfg.file.columns.push(crate::config::ColumnSpec {
            column: "email".to_string(),
            column_type: Default::default(),
            regex: Some(r"^[^@\s]+@[^@\s]+$".to_string()),
            format: None,
            filters: Vec::new(),
        });
        let pipeline = orchestrator(cfg, "held", Arc::new(RecordingDispatcher::default()));

        let header = Header::new(vec!["id".into(), "email".into(), "status".into()]);
        let log_path = dir.path().join("held_errors.csv");
        let error_log = ErrorLog::open(&log_path, &header).unwrap();
        let row = |line: u64, id: &str, email: &str| {
            Record::from_pairs(line, &[("id", id), ("email", email), ("status", "active")])
        };

        // 沒有待送批次時立即計入
        let mut pending = Pending::default();
        pipeline.admit(row(2, "1", "bad"), &mut pending, &error_log);
        assert!(pending.held.is_empty());
        assert_eq!(pipeline.metrics.snapshot().validation_errors, 1);

        pipeline.admit(row(3, "2", "b@x.com"), &mut pending, &error_log);
        pipeline.admit(row(4, "3", "worse"), &mut pending, &error_log);
        assert_eq!(pending.batch.len(), 1);
        assert_eq!(pending.held.len(), 1);
        assert_eq!(pipeline.metrics.snapshot().processed, 1);
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(!log.contains("worse"));

        pipeline.settle(std::mem::take(&mut pending.held), &error_log);
        let snapshot = pipeline.metrics.snapshot();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.validation_errors, 2);
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("2,1,bad,active,400,"));
        assert!(log.contains("4,3,worse,active,400,"));
    }

    #[tokio::test]
    async fn test_missing_input_fails_run() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 1);
        let mut cfg = config(&dir, &input, "");
        cfg.file.input_path = dir.path().join("gone.csv").display().to_string();

        let dispatcher = Arc::new(RecordingDispatcher::default());
        let result = orchestrator(cfg, "missing", dispatcher).run().await;
        assert!(result.is_err());
    }

    #[test]
    fn test_ambiguous_routing_fails_before_reading() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 1);
        let mut cfg = config(&dir, &input, "");
        let mut second = cfg.endpoints[0].clone();
        second.name = "erp".to_string();
        cfg.endpoints.push(second);

        let result = PipelineOrchestrator::with_dispatcher(
            cfg,
            RunOptions::default(),
            Arc::new(RecordingDispatcher::default()),
            Arc::new(MetricsRegistry::new()),
        );
        assert!(matches!(result, Err(EtlError::EndpointResolution { .. })));
    }
}
