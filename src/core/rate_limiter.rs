use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

struct Bucket {
    tokens: u32,
    window_start: Instant,
}

/// 每秒整批補滿的權杖桶
///
/// 沒有設定每秒上限時 `acquire` 直接返回。等待期間持有鎖，
/// 其他請求排在後面，每個視窗最多放行 `capacity` 個請求。
pub struct RateLimiter {
    capacity: Option<u32>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(max_requests_per_second: Option<u32>) -> Self {
        let capacity = max_requests_per_second.filter(|rps| *rps > 0);
        Self {
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity.unwrap_or(0),
                window_start: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> Option<u32> {
        self.capacity
    }

    pub async fn acquire(&self) {
        let Some(capacity) = self.capacity else {
            return;
        };

        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            if now.duration_since(bucket.window_start) >= WINDOW {
                bucket.tokens = capacity;
                bucket.window_start = now;
            }

            if bucket.tokens > 0 {
                bucket.tokens -= 1;
                return;
            }

            let next_window = bucket.window_start + WINDOW;
            tracing::trace!("Rate limit reached, waiting for the next window");
            tokio::time::sleep_until(next_window).await;
        }
    }
}
