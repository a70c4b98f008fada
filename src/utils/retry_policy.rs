// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::services::provider_gateway::ProviderError;
use std::time::Duration;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 瞬时错误，按退避表重试
    Transient,
    /// 终态错误，重试无意义，任务立即失败
    Terminal,
}

/// 重试策略配置
///
/// 退避时间来自按尝试次数索引的延迟表；尝试次数超出表长时
/// 复用最后一项。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数
    pub max_retries: i32,
    /// 退避延迟表，按重试次数索引（第1次重试取第1项）
    pub backoff_table: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_table: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
        }
    }
}

impl RetryPolicy {
    /// 由毫秒延迟表构建策略
    pub fn from_millis(max_retries: i32, table_ms: &[u64]) -> Self {
        let backoff_table = if table_ms.is_empty() {
            Self::default().backoff_table
        } else {
            table_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
        };
        Self {
            max_retries,
            backoff_table,
        }
    }

    /// 计算第 attempt 次重试的退避时间
    ///
    /// attempt 从 1 开始计数；超出表长复用最后一项。
    pub fn backoff(&self, attempt: i32) -> Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.backoff_table.len() - 1);
        self.backoff_table[idx]
    }

    /// 判断给定重试次数下是否还应重试
    pub fn should_retry(&self, error: &ProviderError, retry_count: i32) -> bool {
        classify(error) == ErrorClass::Transient && retry_count < self.max_retries
    }
}

/// 对提供商错误进行瞬时/终态分类
///
/// 超时、提供商侧限流、5xx 与网络错误视为瞬时；鉴权失败、
/// 非法请求、凭证缺失与响应格式错误视为终态。
pub fn classify(error: &ProviderError) -> ErrorClass {
    match error {
        ProviderError::Timeout(_)
        | ProviderError::RateLimited(_)
        | ProviderError::Server { .. }
        | ProviderError::Network(_) => ErrorClass::Transient,
        ProviderError::Auth(_)
        | ProviderError::InvalidRequest(_)
        | ProviderError::MissingCredential { .. }
        | ProviderError::InvalidResponse(_) => ErrorClass::Terminal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_backoff_table_indexing() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_reuses_last_entry() {
        let policy = RetryPolicy::default();

        // 超出表长后一直取最后一项
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
        assert_eq!(policy.backoff(100), Duration::from_secs(5));
    }

    #[test]
    fn test_from_millis_empty_table_falls_back_to_default() {
        let policy = RetryPolicy::from_millis(5, &[]);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));

        let custom = RetryPolicy::from_millis(2, &[500, 1500]);
        assert_eq!(custom.backoff(1), Duration::from_millis(500));
        assert_eq!(custom.backoff(2), Duration::from_millis(1500));
        assert_eq!(custom.backoff(3), Duration::from_millis(1500));
    }

    #[test]
    fn test_classify_transient() {
        assert_eq!(
            classify(&ProviderError::Timeout(Duration::from_secs(30))),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ProviderError::RateLimited("429".to_string())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ProviderError::Server {
                status: 503,
                message: "service unavailable".to_string()
            }),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ProviderError::Network("connection reset".to_string())),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_classify_terminal() {
        assert_eq!(
            classify(&ProviderError::Auth("bad key".to_string())),
            ErrorClass::Terminal
        );
        assert_eq!(
            classify(&ProviderError::InvalidRequest("empty prompt".to_string())),
            ErrorClass::Terminal
        );
        assert_eq!(
            classify(&ProviderError::MissingCredential {
                tenant_id: Uuid::new_v4(),
                provider: "demo".to_string()
            }),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn test_should_retry_respects_max_retries() {
        let policy = RetryPolicy::default();
        let timeout = ProviderError::Timeout(Duration::from_secs(30));
        let auth = ProviderError::Auth("expired".to_string());

        assert!(policy.should_retry(&timeout, 0));
        assert!(policy.should_retry(&timeout, 2));
        assert!(!policy.should_retry(&timeout, 3));
        assert!(!policy.should_retry(&auth, 0));
    }
}
