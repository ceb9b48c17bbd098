use crate::config::{AppConfig, Endpoint};
use crate::core::mapper::PayloadMapper;
use crate::core::metrics::MetricsRegistry;
use crate::core::rate_limiter::RateLimiter;
use crate::domain::model::{Outcome, Record};
use crate::domain::ports::Dispatcher;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MAX_ERROR_BODY_CHARS: usize = 500;

/// 決定一筆記錄要送往哪個端點
///
/// 優先序：執行時指定的名稱 > 記錄中選擇欄位的值 > 預設端點 > 唯一的端點。
/// 指定的名稱或欄位值找不到對應端點時直接失敗，不往下遞補；欄位值為空才會遞補。
pub fn resolve_endpoint<'a>(
    override_name: Option<&str>,
    selector_value: Option<&str>,
    default_name: Option<&str>,
    endpoints: &'a [Endpoint],
) -> Result<&'a Endpoint> {
    let find = |name: &str| endpoints.iter().find(|e| e.name == name);

    if let Some(name) = override_name {
        return find(name).ok_or_else(|| EtlError::EndpointResolution {
            message: format!("endpoint '{}' is not configured", name),
        });
    }

    if let Some(value) = selector_value.map(str::trim).filter(|v| !v.is_empty()) {
        return find(value).ok_or_else(|| EtlError::EndpointResolution {
            message: format!("no endpoint named '{}' for this record", value),
        });
    }

    if let Some(name) = default_name {
        return find(name).ok_or_else(|| EtlError::EndpointResolution {
            message: format!("default endpoint '{}' is not configured", name),
        });
    }

    match endpoints {
        [only] => Ok(only),
        [] => Err(EtlError::EndpointResolution {
            message: "no endpoints configured".to_string(),
        }),
        _ => Err(EtlError::EndpointResolution {
            message: format!(
                "{} endpoints configured but no endpoint name, selector column or default endpoint",
                endpoints.len()
            ),
        }),
    }
}

/// 端點路由：與記錄無關時在啟動時就決定好
#[derive(Debug, Clone)]
pub struct EndpointRouter {
    endpoints: Vec<Endpoint>,
    fixed: Option<usize>,
    selector_column: Option<String>,
    default_endpoint: Option<String>,
}

impl EndpointRouter {
    pub fn new(config: &AppConfig, override_name: Option<&str>) -> Result<Self> {
        let endpoints = config.endpoints.clone();
        let selector_column = config
            .routing
            .endpoint_column
            .clone()
            .filter(|c| !c.trim().is_empty());
        let default_endpoint = config.routing.default_endpoint.clone();

        let fixed = if override_name.is_some() || selector_column.is_none() {
            let endpoint = resolve_endpoint(
                override_name,
                None,
                default_endpoint.as_deref(),
                &endpoints,
            )?;
            tracing::info!("🎯 All records go to endpoint '{}'", endpoint.name);
            endpoints.iter().position(|e| e.name == endpoint.name)
        } else {
            tracing::info!(
                "🎯 Endpoint chosen per record from column '{}'",
                selector_column.as_deref().unwrap_or_default()
            );
            None
        };

        Ok(Self {
            endpoints,
            fixed,
            selector_column,
            default_endpoint,
        })
    }

    pub fn is_static(&self) -> bool {
        self.fixed.is_some()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn route(&self, record: &Record) -> Result<&Endpoint> {
        if let Some(index) = self.fixed {
            return Ok(&self.endpoints[index]);
        }

        let selector_value = self
            .selector_column
            .as_deref()
            .and_then(|column| record.get(column));

        resolve_endpoint(
            None,
            selector_value,
            self.default_endpoint.as_deref(),
            &self.endpoints,
        )
    }
}

/// 透過 HTTP 送出記錄，負責限流與重試
pub struct DispatchClient {
    client: Client,
    mappers: HashMap<String, PayloadMapper>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
    metrics: Arc<MetricsRegistry>,
    dry_run: bool,
}

impl DispatchClient {
    pub fn new(endpoints: &[Endpoint], metrics: Arc<MetricsRegistry>, dry_run: bool) -> Result<Self> {
        let client = Client::builder().build()?;

        let mappers = endpoints
            .iter()
            .map(|e| (e.name.clone(), PayloadMapper::new(&e.mapping)))
            .collect();

        if dry_run {
            tracing::info!("🧪 Dry run: requests are logged, not sent");
        }

        Ok(Self {
            client,
            mappers,
            limiters: Mutex::new(HashMap::new()),
            metrics,
            dry_run,
        })
    }

    /// 每個端點第一次使用時才建立限流器
    fn limiter_for(&self, endpoint: &Endpoint) -> Arc<RateLimiter> {
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(limiters.entry(endpoint.name.clone()).or_insert_with(|| {
            if let Some(rps) = endpoint.max_requests_per_second {
                tracing::debug!("⏱️ Rate limit for '{}': {} req/s", endpoint.name, rps);
            }
            Arc::new(RateLimiter::new(endpoint.max_requests_per_second))
        }))
    }

    fn build_body(&self, record: &Record, endpoint: &Endpoint) -> Result<String> {
        let payload = match self.mappers.get(&endpoint.name) {
            Some(mapper) => mapper.build(record)?,
            None => PayloadMapper::new(&endpoint.mapping).build(record)?,
        };
        Ok(serde_json::to_string(&payload)?)
    }

    async fn send_once(&self, endpoint: &Endpoint, body: &str) -> std::result::Result<(StatusCode, String), reqwest::Error> {
        let mut request = self
            .client
            .request(endpoint.method.as_reqwest(), &endpoint.url)
            .timeout(Duration::from_secs(endpoint.timeout_seconds))
            .header(CONTENT_TYPE, "application/json");

        for (name, value) in &endpoint.headers {
            if name.eq_ignore_ascii_case(CONTENT_TYPE.as_str())
                || name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str())
            {
                tracing::debug!("Header '{}' is set from the request body, skipped", name);
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(body.to_string()).send().await?;
        let status = response.status();
        let text = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        Ok((status, text))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn truncate(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", cut)
    }
}

#[async_trait]
impl Dispatcher for DispatchClient {
    async fn dispatch(&self, record: &Record, endpoint: &Endpoint) -> Outcome {
        let body = match self.build_body(record, endpoint) {
            Ok(body) => body,
            Err(e) => {
                return Outcome::Failure {
                    status: None,
                    message: e.to_string(),
                    attempts: 0,
                }
            }
        };

        let limiter = self.limiter_for(endpoint);

        if self.dry_run {
            limiter.acquire().await;
            tracing::info!(
                "🧪 [DRY RUN] line {} -> {} {} {}",
                record.line_number(),
                endpoint.method.as_str(),
                endpoint.url,
                body
            );
            return Outcome::Success {
                status: None,
                attempts: 1,
            };
        }

        let max_attempts = endpoint.retry_attempts.max(1);
        let delay = Duration::from_secs(endpoint.retry_delay_seconds);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > 1 {
                self.metrics.record_retry();
                tokio::time::sleep(delay).await;
            }

            limiter.acquire().await;
            let started = Instant::now();

            let (status, message, retryable) = match self.send_once(endpoint, &body).await {
                Ok((status, _)) if status.is_success() => {
                    self.metrics.record_response(started.elapsed(), status.as_u16());
                    tracing::debug!(
                        "✅ line {} -> {} ({})",
                        record.line_number(),
                        endpoint.name,
                        status.as_u16()
                    );
                    return Outcome::Success {
                        status: Some(status.as_u16()),
                        attempts: attempt,
                    };
                }
                Ok((status, text)) => {
                    self.metrics.record_response(started.elapsed(), status.as_u16());
                    let message = if text.trim().is_empty() {
                        format!("HTTP {}", status.as_u16())
                    } else {
                        format!("HTTP {}: {}", status.as_u16(), truncate(&text))
                    };
                    (Some(status.as_u16()), message, is_retryable_status(status))
                }
                Err(e) => (None, e.to_string(), is_retryable_error(&e)),
            };

            if !retryable || attempt >= max_attempts {
                return Outcome::Failure {
                    status,
                    message,
                    attempts: attempt,
                };
            }

            tracing::warn!(
                "🔄 line {} attempt {}/{} to '{}' failed: {}",
                record.line_number(),
                attempt,
                max_attempts,
                endpoint.name,
                message
            );
        }
    }
}
