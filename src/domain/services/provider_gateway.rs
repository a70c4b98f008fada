// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// 提供商调用错误类型
///
/// 变体粒度以重试策略的分类需求为准：瞬时（超时、限流、5xx、
/// 网络）与终态（鉴权、非法请求、凭证缺失）必须可区分。
#[derive(Error, Debug)]
pub enum ProviderError {
    /// 调用超出时间预算
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    /// 被提供商限流（HTTP 429）
    #[error("Provider rate limited the request: {0}")]
    RateLimited(String),

    /// 提供商服务端错误（HTTP 5xx）
    #[error("Provider server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// 鉴权失败（HTTP 401/403）
    #[error("Provider authentication failed: {0}")]
    Auth(String),

    /// 请求本身非法，重试无意义（其余 4xx）
    #[error("Invalid request rejected by provider: {0}")]
    InvalidRequest(String),

    /// 网络层错误（连接失败、连接重置等）
    #[error("Network error: {0}")]
    Network(String),

    /// 租户没有该提供商的可用凭证
    #[error("No credential for tenant {tenant_id} and provider {provider}")]
    MissingCredential { tenant_id: Uuid, provider: String },

    /// 响应格式无法解析
    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),
}

/// 提供商网关特质
///
/// 队列对外部AI服务的全部依赖：一次不透明的
/// `invoke(prompt) -> text | error` 调用，以及恢复服务在重新入队
/// 之前需要的凭证存在性检查。具体提供商语义不属于本子系统。
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// 以指定租户的凭证调用提供商
    ///
    /// # 参数
    ///
    /// * `tenant_id` - 租户ID，决定使用哪份凭证
    /// * `provider` - 提供商键名
    /// * `prompt` - 完整请求文本
    /// * `timeout` - 本次调用的墙钟时间预算
    ///
    /// # 返回值
    ///
    /// * `Ok(String)` - 提供商输出文本
    /// * `Err(ProviderError)` - 带分类信息的失败
    async fn invoke(
        &self,
        tenant_id: Uuid,
        provider: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError>;

    /// 检查租户是否持有该提供商的可用凭证
    async fn has_credential(&self, tenant_id: Uuid, provider: &str) -> bool;
}

#[async_trait]
impl<T: ProviderGateway + ?Sized> ProviderGateway for std::sync::Arc<T> {
    async fn invoke(
        &self,
        tenant_id: Uuid,
        provider: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        (**self).invoke(tenant_id, provider, prompt, timeout).await
    }

    async fn has_credential(&self, tenant_id: Uuid, provider: &str) -> bool {
        (**self).has_credential(tenant_id, provider).await
    }
}
