use crate::errors::AppError;
use log::warn;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// 指数退避策略：初始等待 `initial`，每次翻倍，不超过 `max`，并叠加随机抖动
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64, max_retries: u32) -> Self {
        Self {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms.max(initial_ms)),
            max_retries,
        }
    }

    /// 第 `attempt` 次重试前的等待时间（attempt 从 0 开始）
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = (self.initial.as_millis() as u64).saturating_mul(1u64 << attempt.min(20));
        let base_ms = base_ms.min(self.max.as_millis() as u64);
        // 抖动：0 ~ base/2，避免多个 worker 同步重试
        let half = base_ms / 2;
        let jitter = if half > 0 { rand::rng().random_range(0..half) } else { 0 };
        Duration::from_millis((base_ms + jitter).min(self.max.as_millis() as u64))
    }
}

/// 通用异步重试：仅对 `AppError::is_retryable` 的错误退避重试，其余错误立即返回
pub async fn retry_with_backoff<T, F, Fut>(backoff: &Backoff, what: &str, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < backoff.max_retries => {
                let wait = backoff.delay(attempt);
                warn!("⚠️ {} failed (attempt {}), retry in {:?}: {}", what, attempt + 1, wait, e);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
