use std::future::Future;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::Result;

/// 临时性存储错误的重试策略，延迟按指数增长
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数，不含第一次尝试
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 第一次重试前的等待时间（毫秒）
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 单次等待时间上限（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2000
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_retries: 0, ..Default::default() }
    }

    /// 第 attempt 次重试前的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// 执行 `op`，遇到临时性错误时按策略重试，永久性错误直接返回
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                warn!("{name} 失败（第 {attempt} 次重试，等待 {delay:?}）: {e}");
                sleep(delay).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::Error;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, base_delay_ms: 1, max_delay_ms: 2 }
    }

    #[test]
    fn test_delay_grows_and_saturates() {
        let policy = RetryPolicy { max_retries: 10, base_delay_ms: 50, max_delay_ms: 300 };
        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
        assert_eq!(policy.delay(80), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&fast_policy(3), "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("connection reset"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&fast_policy(2), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient("timeout"))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&fast_policy(5), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::permanent("authentication failed"))
        })
        .await;
        assert!(matches!(result, Err(Error::Store { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
