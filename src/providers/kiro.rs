//! Kiro/CodeWhisperer Provider
//!
//! 维护 access token 生命周期（临近过期主动刷新、401 单次透明
//! 刷新重试、403 直接致命）、构造上游请求并以指数退避执行。
//! 请求体转换见 `converter`，事件流解析见 `stream`。

use chrono::{Duration, Utc};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration as StdDuration;

use crate::converter::claude_to_codewhisperer::{build_codewhisperer_payload, map_model_id};
use crate::credential::{KiroCredentialStore, KiroCredentials};
use crate::models::claude::ClaudeRequest;
use crate::models::machine_id::machine_id_for;
use crate::providers::{ProviderError, RetryPolicy};

/// 上游请求硬超时
const REQUEST_TIMEOUT_SECS: u64 = 120;
/// 健康检查超时
const HEALTH_CHECK_TIMEOUT_SECS: u64 = 30;
/// 伪装的 Kiro IDE 版本号
const KIRO_VERSION: &str = "0.1.25";

#[derive(Debug)]
pub struct KiroProvider {
    pub credentials: KiroCredentials,
    store: KiroCredentialStore,
    client: Client,
    retry: RetryPolicy,
    /// Token 临近过期窗口（分钟）
    cron_near_minutes: i64,
    /// 池凭证 uuid，机器码种子
    credential_uuid: Option<String>,
}

impl KiroProvider {
    /// 从凭证存储初始化
    ///
    /// 凭证文件缺失或损坏是 `LocalConfigError`：仅该适配器失败，
    /// 其余适配器继续工作。
    pub async fn from_store(
        store: KiroCredentialStore,
        credential_uuid: Option<String>,
    ) -> Result<Self, ProviderError> {
        let credentials = store.load().await?;

        let client = Client::builder()
            .timeout(StdDuration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| ProviderError::LocalConfigError(format!("http client: {}", e)))?;

        Ok(Self {
            credentials,
            store,
            client,
            retry: RetryPolicy::default(),
            cron_near_minutes: 10,
            credential_uuid,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cron_near_minutes(mut self, minutes: i64) -> Self {
        self.cron_near_minutes = minutes;
        self
    }

    /// 聊天端点，amazonq 系列模型走 CodeWhisperer 流式端点
    pub fn chat_url(&self, model: &str) -> String {
        let region = self.credentials.region();
        if model.starts_with("amazonq") {
            format!("https://codewhisperer.{region}.amazonaws.com/SendMessageStreaming")
        } else {
            format!("https://q.{region}.amazonaws.com/generateAssistantResponse")
        }
    }

    /// 刷新端点，按认证方式区分
    pub fn refresh_url(&self) -> String {
        let region = self.credentials.region();
        if self.credentials.auth_method() == "idc" {
            format!("https://oidc.{region}.amazonaws.com/token")
        } else {
            format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken")
        }
    }

    /// 用量查询端点
    pub fn usage_limits_url(&self) -> String {
        format!(
            "https://q.{}.amazonaws.com/getUsageLimits",
            self.credentials.region()
        )
    }

    /// 凭证机器码（uuid > profileArn > clientId）
    fn machine_id(&self) -> String {
        machine_id_for(
            self.credential_uuid.as_deref(),
            self.credentials.profile_arn.as_deref(),
            self.credentials.client_id.as_deref(),
        )
    }

    /// 确保持有有效 token，临近过期主动刷新
    pub async fn ensure_valid_token(&mut self) -> Result<String, ProviderError> {
        if self.credentials.access_token.is_none()
            || self
                .credentials
                .is_expiring_within_minutes(self.cron_near_minutes)
        {
            self.refresh_token().await?;
        }

        self.credentials
            .access_token
            .clone()
            .ok_or_else(|| ProviderError::LocalConfigError("no accessToken".to_string()))
    }

    /// 刷新 token 并持久化
    ///
    /// social 流程只提交 refreshToken；IdC 流程附带 clientId/
    /// clientSecret/grantType。成功后通过 Credential Store 落盘，
    /// 文件锁保证并发刷新不撕裂凭证文件。
    pub async fn refresh_token(&mut self) -> Result<String, ProviderError> {
        self.credentials.validate_refresh_token()?;

        let refresh_token = self
            .credentials
            .refresh_token
            .clone()
            .ok_or_else(|| ProviderError::LocalConfigError("no refreshToken".to_string()))?;

        let auth_method = self.credentials.auth_method().to_string();
        let refresh_url = self.refresh_url();

        tracing::info!("[KIRO] refreshing token via {} flow", auth_method);

        let resp = if auth_method == "idc" {
            let client_id = self.credentials.client_id.as_ref().ok_or_else(|| {
                ProviderError::LocalConfigError("idc flow requires clientId".to_string())
            })?;
            let client_secret = self.credentials.client_secret.as_ref().ok_or_else(|| {
                ProviderError::LocalConfigError("idc flow requires clientSecret".to_string())
            })?;

            let body = serde_json::json!({
                "refreshToken": &refresh_token,
                "clientId": client_id,
                "clientSecret": client_secret,
                "grantType": "refresh_token"
            });

            self.client
                .post(&refresh_url)
                .header("Content-Type", "application/json")
                .header(
                    "x-amz-user-agent",
                    "aws-sdk-js/3.738.0 ua/2.1 os/other lang/js api/sso-oidc#3.738.0 m/E KiroIDE",
                )
                .header("User-Agent", "node")
                .json(&body)
                .send()
                .await?
        } else {
            let body = serde_json::json!({ "refreshToken": &refresh_token });

            self.client
                .post(&refresh_url)
                .header(
                    "User-Agent",
                    format!("KiroIDE-{}-{}", KIRO_VERSION, self.machine_id()),
                )
                .header("Accept", "application/json, text/plain, */*")
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await?
        };

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            tracing::warn!("[KIRO] token refresh failed: {} - {}", status, body_text);
            return Err(match status.as_u16() {
                s if s >= 500 => {
                    ProviderError::UpstreamServerError(format!("refresh HTTP {}: {}", s, body_text))
                }
                429 => ProviderError::Throttled(format!("refresh: {}", body_text)),
                s => ProviderError::AuthFatal(format!("refresh HTTP {}: {}", s, body_text)),
            });
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::UpstreamMalformed(format!("refresh body: {}", e)))?;

        // AWS OIDC 返回 snake_case，social 端点返回 camelCase
        let new_token = data["accessToken"]
            .as_str()
            .or_else(|| data["access_token"].as_str())
            .ok_or_else(|| {
                ProviderError::UpstreamMalformed("no access token in refresh response".to_string())
            })?
            .to_string();

        self.credentials.access_token = Some(new_token.clone());

        if let Some(rt) = data["refreshToken"]
            .as_str()
            .or_else(|| data["refresh_token"].as_str())
        {
            self.credentials.refresh_token = Some(rt.to_string());
        }
        if let Some(arn) = data["profileArn"].as_str() {
            self.credentials.profile_arn = Some(arn.to_string());
        }
        if let Some(expires_in) = data["expiresIn"]
            .as_i64()
            .or_else(|| data["expires_in"].as_i64())
        {
            let expires_at = Utc::now() + Duration::seconds(expires_in);
            self.credentials.expires_at = Some(expires_at.to_rfc3339());
        }

        self.store
            .persist_refresh(
                &new_token,
                self.credentials.refresh_token.as_deref(),
                self.credentials.expires_at.as_deref(),
                self.credentials.profile_arn.as_deref(),
            )
            .await?;

        tracing::info!(
            "[KIRO] token refreshed, expires at {:?}",
            self.credentials.expires_at
        );

        Ok(new_token)
    }

    /// 构造上游调用的通用请求头
    fn request_builder(&self, url: &str, token: &str) -> reqwest::RequestBuilder {
        let machine_id = self.machine_id();
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
            .header("amz-sdk-request", "attempt=1; max=1")
            .header(
                "x-amz-user-agent",
                format!("aws-sdk-js/1.0.7 KiroIDE-{KIRO_VERSION}-{machine_id}"),
            )
            .header(
                "user-agent",
                format!(
                    "aws-sdk-js/1.0.7 ua/2.1 os/macos#14.0 lang/js md/nodejs#20.16.0 api/codewhispererstreaming#1.0.7 m/E KiroIDE-{KIRO_VERSION}-{machine_id}"
                ),
            )
            .header("x-amzn-kiro-agent-mode", "vibe")
    }

    /// 执行聊天请求，返回流式响应体
    ///
    /// 重试阶梯：
    /// - 401：单次刷新后重试，再次 401 致命
    /// - 403：不重试，直接致命
    /// - 429/5xx/网络瞬态：指数退避，至多 max_retries 次
    pub async fn call_api(
        &mut self,
        request: &ClaudeRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let payload = build_codewhisperer_payload(request, self.profile_arn_for_payload());
        let url = self.chat_url(&request.model);
        self.execute_with_retry(&url, &payload).await
    }

    /// social 认证时请求体需携带 profileArn
    fn profile_arn_for_payload(&self) -> Option<String> {
        if self.credentials.auth_method() == "social" {
            self.credentials.profile_arn.clone()
        } else {
            None
        }
    }

    async fn execute_with_retry(
        &mut self,
        url: &str,
        payload: &Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut token = self.ensure_valid_token().await?;
        let mut refreshed = false;
        let mut attempt: u32 = 0;

        loop {
            let result = self
                .request_builder(url, &token)
                .json(payload)
                .send()
                .await;

            let resp = match result {
                Ok(r) => r,
                Err(e) => {
                    let err = ProviderError::from(e);
                    if err.is_retryable() && attempt + 1 < self.retry.max_retries {
                        let delay = self.retry.backoff(attempt);
                        tracing::warn!(
                            "[KIRO] request error (attempt {}/{}): {}, retrying in {:?}",
                            attempt + 1,
                            self.retry.max_retries,
                            err,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            let body_text = resp.text().await.unwrap_or_default();

            match status.as_u16() {
                401 if !refreshed => {
                    tracing::warn!("[KIRO] 401, refreshing token once");
                    match self.refresh_token().await {
                        Ok(t) => {
                            token = t;
                            refreshed = true;
                            continue;
                        }
                        Err(e) => {
                            return Err(ProviderError::AuthFatal(format!(
                                "401 then refresh failed: {}",
                                e
                            )));
                        }
                    }
                }
                401 => {
                    return Err(ProviderError::AuthFatal(format!(
                        "401 after refresh: {}",
                        body_text
                    )));
                }
                403 => {
                    return Err(ProviderError::AuthFatal(format!("403: {}", body_text)));
                }
                s if s == 429 || s >= 500 => {
                    let err = ProviderError::from_status(s, &body_text, refreshed);
                    if attempt + 1 < self.retry.max_retries {
                        let delay = self.retry.backoff(attempt);
                        tracing::warn!(
                            "[KIRO] HTTP {} (attempt {}/{}), waiting {:?}",
                            s,
                            attempt + 1,
                            self.retry.max_retries,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
                s => {
                    return Err(ProviderError::from_status(s, &body_text, refreshed));
                }
            }
        }
    }

    /// 最小探活请求
    ///
    /// 与实际调用走相同端点和头部，请求体只带一条 "Hi" 用户消息。
    pub async fn health_check(&mut self, model: &str) -> Result<(), ProviderError> {
        let token = self.ensure_valid_token().await?;
        let model_id = map_model_id(model);

        let conversation_id = uuid::Uuid::new_v4().to_string();
        let mut payload = serde_json::json!({
            "conversationState": {
                "chatTriggerType": "MANUAL",
                "conversationId": conversation_id,
                "currentMessage": {
                    "userInputMessage": {
                        "content": "Hi",
                        "modelId": model_id,
                        "origin": "AI_EDITOR"
                    }
                }
            }
        });
        if let Some(arn) = self.profile_arn_for_payload() {
            payload["profileArn"] = serde_json::json!(arn);
        }

        let url = self.chat_url(model);
        let resp = self
            .request_builder(&url, &token)
            .json(&payload)
            .timeout(StdDuration::from_secs(HEALTH_CHECK_TIMEOUT_SECS))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(ProviderError::from_status(status.as_u16(), &body, true))
        }
    }

    /// 查询账户用量额度
    pub async fn get_usage_limits(&mut self) -> Result<Value, ProviderError> {
        let token = self.ensure_valid_token().await?;
        let url = self.usage_limits_url();

        let mut payload = serde_json::json!({});
        if let Some(arn) = self.profile_arn_for_payload() {
            payload["profileArn"] = serde_json::json!(arn);
        }

        let resp = self
            .request_builder(&url, &token)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body, true));
        }

        resp.json()
            .await
            .map_err(|e| ProviderError::UpstreamMalformed(format!("usage limits body: {}", e)))
    }
}
