use crate::config::Endpoint;
use crate::domain::model::{Outcome, Record};
use async_trait::async_trait;

/// 將一筆記錄送往指定端點
///
/// 實作需自行處理重試與限流，回傳最終結果；單筆失敗不應讓整個執行中止。
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, record: &Record, endpoint: &Endpoint) -> Outcome;
}
