//! 健康检查调度
//!
//! 周期性驱动 Pool Manager 的探活扫描（健康凭证被真实流量隐式
//! 验证，扫描只关心不健康凭证的恢复），并提供各 Provider 的
//! 最小探活实现。探活请求统一是一条 "Hi" 用户消息，失败原因
//! 交回池层做窗口计数。

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::credential::KiroCredentialStore;
use crate::models::provider_pool_model::{CredentialData, ProviderCredential};
use crate::providers::kiro::KiroProvider;
use crate::providers::{HealthProbe, ProviderError};
use crate::services::provider_pool_service::ProviderPoolService;

/// 探活请求超时
const PROBE_TIMEOUT_SECS: u64 = 30;

/// 真实上游探针
pub struct UpstreamHealthProbe {
    client: reqwest::Client,
}

impl Default for UpstreamHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamHealthProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
                .pool_max_idle_per_host(5)
                .build()
                .unwrap_or_default(),
        }
    }

    /// OpenAI 协议探活（chat/completions）
    async fn check_openai(
        &self,
        api_key: &str,
        base_url: Option<&str>,
        model: &str,
    ) -> Result<(), ProviderError> {
        let base = base_url.unwrap_or("https://api.openai.com");
        let base = base.trim_end_matches('/');
        let url = if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        };

        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 10
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        status_to_result(resp).await
    }

    /// Claude 协议探活（messages）
    async fn check_claude(
        &self,
        api_key: &str,
        base_url: Option<&str>,
        model: &str,
    ) -> Result<(), ProviderError> {
        let base = base_url.unwrap_or("https://api.anthropic.com");
        let base = base.trim_end_matches('/');
        let url = if base.ends_with("/v1") {
            format!("{}/messages", base)
        } else {
            format!("{}/v1/messages", base)
        };

        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 10
        });

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        status_to_result(resp).await
    }

    /// Gemini CLI OAuth 探活（loadCodeAssist，最小可靠接口）
    async fn check_gemini_oauth(&self, creds_path: &str) -> Result<(), ProviderError> {
        let access_token = read_access_token(creds_path).await?;
        let url = "https://cloudcode-pa.googleapis.com/v1internal:loadCodeAssist";
        let body = serde_json::json!({
            "cloudaicompanionProject": "",
            "metadata": {
                "ideType": "IDE_UNSPECIFIED",
                "platform": "PLATFORM_UNSPECIFIED",
                "pluginType": "GEMINI",
                "duetProject": ""
            }
        });

        let resp = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;
        status_to_result(resp).await
    }

    /// Antigravity 探活（fetchAvailableModels）
    async fn check_antigravity(&self, creds_path: &str) -> Result<(), ProviderError> {
        let access_token = read_access_token(creds_path).await?;
        let url =
            "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:fetchAvailableModels";

        let resp = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .header("User-Agent", "antigravity/1.11.5 windows/amd64")
            .json(&serde_json::json!({}))
            .send()
            .await?;
        status_to_result(resp).await
    }

    /// Qwen OAuth 探活（OpenAI 协议，resource_url 优先）
    async fn check_qwen(&self, creds_path: &str, model: &str) -> Result<(), ProviderError> {
        let content = tokio::fs::read_to_string(creds_path)
            .await
            .map_err(|e| ProviderError::LocalConfigError(format!("read {}: {}", creds_path, e)))?;
        let creds: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| ProviderError::LocalConfigError(format!("parse {}: {}", creds_path, e)))?;
        let access_token = creds["access_token"]
            .as_str()
            .ok_or_else(|| ProviderError::LocalConfigError("no access_token".to_string()))?;

        let base_url = match creds["resource_url"].as_str() {
            Some(resource_url) if resource_url.starts_with("http") => {
                format!("{}/v1", resource_url.trim_end_matches('/'))
            }
            Some(resource_url) => format!("https://{}/v1", resource_url),
            None => "https://portal.qwen.ai/v1".to_string(),
        };

        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 10
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", base_url))
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;
        status_to_result(resp).await
    }
}

async fn read_access_token(creds_path: &str) -> Result<String, ProviderError> {
    let content = tokio::fs::read_to_string(creds_path)
        .await
        .map_err(|e| ProviderError::LocalConfigError(format!("read {}: {}", creds_path, e)))?;
    let creds: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| ProviderError::LocalConfigError(format!("parse {}: {}", creds_path, e)))?;
    creds["access_token"]
        .as_str()
        .or_else(|| creds["accessToken"].as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ProviderError::LocalConfigError("no access_token".to_string()))
}

async fn status_to_result(resp: reqwest::Response) -> Result<(), ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), &body, true))
}

#[async_trait::async_trait]
impl HealthProbe for UpstreamHealthProbe {
    async fn probe(
        &self,
        credential: &ProviderCredential,
        model: &str,
    ) -> Result<(), ProviderError> {
        match &credential.credential {
            CredentialData::KiroOAuth { creds_file_path } => {
                let mut provider = KiroProvider::from_store(
                    KiroCredentialStore::new(creds_file_path),
                    Some(credential.uuid.clone()),
                )
                .await?;
                provider.health_check(model).await
            }
            CredentialData::GeminiOAuth {
                creds_file_path, ..
            } => self.check_gemini_oauth(creds_file_path).await,
            CredentialData::AntigravityOAuth {
                creds_file_path, ..
            } => self.check_antigravity(creds_file_path).await,
            CredentialData::QwenOAuth { creds_file_path } => {
                self.check_qwen(creds_file_path, model).await
            }
            CredentialData::OpenAIKey { api_key, base_url }
            | CredentialData::OpenAIResponsesKey { api_key, base_url } => {
                self.check_openai(api_key, base_url.as_deref(), model).await
            }
            CredentialData::ClaudeKey { api_key, base_url } => {
                self.check_claude(api_key, base_url.as_deref(), model).await
            }
        }
    }
}

/// 健康检查调度器
///
/// 启动时先做一轮初始化扫描（无视退避窗口），之后按配置的间隔
/// 周期扫描。生命周期由 Pool Manager 的所有者统一管理。
pub struct HealthCheckService {
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthCheckService {
    pub fn start(pool: Arc<ProviderPoolService>, interval_ms: u64) -> Self {
        let handle = tokio::spawn(async move {
            pool.perform_health_checks(true).await;

            let mut interval =
                tokio::time::interval(Duration::from_millis(interval_ms.max(1000)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                pool.perform_health_checks(false).await;
            }
        });

        Self {
            task: StdMutex::new(Some(handle)),
        }
    }

    pub fn destroy(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for HealthCheckService {
    fn drop(&mut self) {
        self.destroy();
    }
}
