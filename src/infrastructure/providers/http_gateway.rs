// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::services::provider_gateway::{ProviderError, ProviderGateway};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// 单个提供商的HTTP端点配置
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    /// API基础URL
    pub base_url: String,
    /// 使用的模型名称
    pub model: String,
}

/// 基于HTTP的提供商网关
///
/// 以 OpenAI 风格的 chat/completions 协议调用外部AI服务。
/// 凭证按 (tenant, provider) 存放，可在运行时增删；
/// 端点配置（URL与模型）来自进程配置，按提供商键名索引。
pub struct HttpProviderGateway {
    /// 各提供商的端点配置
    endpoints: HashMap<String, ProviderEndpoint>,
    /// (tenant, provider) -> API密钥
    credentials: DashMap<(Uuid, String), String>,
    /// HTTP客户端
    client: reqwest::Client,
}

impl HttpProviderGateway {
    /// 创建新的提供商网关实例
    ///
    /// # 参数
    ///
    /// * `endpoints` - 各提供商的端点配置
    ///
    /// # 返回值
    ///
    /// 返回新的提供商网关实例
    pub fn new(endpoints: HashMap<String, ProviderEndpoint>) -> Self {
        Self {
            endpoints,
            credentials: DashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    /// 写入或替换某租户对某提供商的凭证
    pub fn set_credential(&self, tenant_id: Uuid, provider: &str, api_key: String) {
        self.credentials
            .insert((tenant_id, provider.to_string()), api_key);
    }

    /// 移除某租户对某提供商的凭证
    pub fn remove_credential(&self, tenant_id: Uuid, provider: &str) {
        self.credentials.remove(&(tenant_id, provider.to_string()));
    }

    fn parse_completion(body: &Value) -> Result<String, ProviderError> {
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing choices[0].message.content".to_string())
            })
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    async fn invoke(
        &self,
        tenant_id: Uuid,
        provider: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let endpoint = self.endpoints.get(provider).ok_or_else(|| {
            ProviderError::InvalidRequest(format!("unknown provider: {}", provider))
        })?;

        let api_key = self
            .credentials
            .get(&(tenant_id, provider.to_string()))
            .map(|k| k.value().clone())
            .ok_or_else(|| ProviderError::MissingCredential {
                tenant_id,
                provider: provider.to_string(),
            })?;

        let request_body = json!({
            "model": endpoint.model,
            "messages": [
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "temperature": 0.0
        });

        let url = format!("{}/chat/completions", endpoint.base_url);
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request_body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(timeout)
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited(message),
                401 | 403 => ProviderError::Auth(message),
                code if code >= 500 => ProviderError::Server {
                    status: code,
                    message,
                },
                _ => ProviderError::InvalidRequest(message),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Self::parse_completion(&body)
    }

    async fn has_credential(&self, tenant_id: Uuid, provider: &str) -> bool {
        self.credentials
            .contains_key(&(tenant_id, provider.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway_for(server_uri: &str) -> HttpProviderGateway {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "demo".to_string(),
            ProviderEndpoint {
                base_url: server_uri.to_string(),
                model: "demo-model".to_string(),
            },
        );
        HttpProviderGateway::new(endpoints)
    }

    #[tokio::test]
    async fn test_invoke_success_parses_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Bonjour"}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
            })))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server.uri());
        let tenant = Uuid::new_v4();
        gateway.set_credential(tenant, "demo", "sk-test".to_string());

        let text = gateway
            .invoke(tenant, "demo", "Translate: hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(text, "Bonjour");
    }

    #[tokio::test]
    async fn test_invoke_without_credential() {
        let server = MockServer::start().await;
        let gateway = gateway_for(&server.uri());
        let tenant = Uuid::new_v4();

        assert!(!gateway.has_credential(tenant, "demo").await);
        let err = gateway
            .invoke(tenant, "demo", "x", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredential { .. }));

        gateway.set_credential(tenant, "demo", "sk-test".to_string());
        assert!(gateway.has_credential(tenant, "demo").await);

        gateway.remove_credential(tenant, "demo");
        assert!(!gateway.has_credential(tenant, "demo").await);
    }

    #[tokio::test]
    async fn test_invoke_maps_status_codes_to_error_classes() {
        let cases = [
            (429, "rate"),
            (500, "server"),
            (401, "auth"),
            (400, "invalid"),
        ];

        for (code, kind) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .respond_with(ResponseTemplate::new(code))
                .mount(&server)
                .await;

            let gateway = gateway_for(&server.uri());
            let tenant = Uuid::new_v4();
            gateway.set_credential(tenant, "demo", "sk-test".to_string());

            let err = gateway
                .invoke(tenant, "demo", "x", Duration::from_secs(5))
                .await
                .unwrap_err();

            match kind {
                "rate" => assert!(matches!(err, ProviderError::RateLimited(_))),
                "server" => assert!(matches!(err, ProviderError::Server { status: 500, .. })),
                "auth" => assert!(matches!(err, ProviderError::Auth(_))),
                _ => assert!(matches!(err, ProviderError::InvalidRequest(_))),
            }
        }
    }

    #[tokio::test]
    async fn test_invoke_unknown_provider() {
        let gateway = HttpProviderGateway::new(HashMap::new());
        let err = gateway
            .invoke(Uuid::new_v4(), "nope", "x", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_invoke_malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let gateway = gateway_for(&server.uri());
        let tenant = Uuid::new_v4();
        gateway.set_credential(tenant, "demo", "sk-test".to_string());

        let err = gateway
            .invoke(tenant, "demo", "x", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }
}
