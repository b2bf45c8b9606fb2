//! Kiro 凭证存储
//!
//! 负责 Kiro OAuth 凭证文件的加载、合并与持久化：
//! - 加载顺序：base64 凭证包（如提供）→ 主凭证文件 → 同目录兄弟 JSON
//!   文件（适配 client_id/refresh_token 分离的布局）
//! - 兄弟文件的键覆盖主文件，但 `expiresAt` 只信任主文件
//! - 持久化走文件锁保护的读-改-写 + 临时文件原子替换，
//!   跨进程并发刷新不会留下撕裂的 JSON

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::providers::ProviderError;

/// Kiro OAuth 凭证
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroCredentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub profile_arn: Option<String>,
    /// 过期时间（RFC3339 字符串）
    pub expires_at: Option<String>,
    pub region: Option<String>,
    /// 认证方式：social 或 idc
    pub auth_method: Option<String>,
}

impl KiroCredentials {
    /// region，缺省 us-east-1
    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or("us-east-1")
    }

    /// 认证方式，缺省 social
    pub fn auth_method(&self) -> &str {
        self.auth_method.as_deref().unwrap_or("social")
    }

    /// Token 是否在指定分钟数内过期
    ///
    /// 无法解析过期时间时保守地返回 true（触发刷新）。
    pub fn is_expiring_within_minutes(&self, minutes: i64) -> bool {
        match self
            .expires_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            Some(expires) => {
                expires.with_timezone(&Utc) - Utc::now() <= Duration::minutes(minutes)
            }
            None => true,
        }
    }

    /// 校验 refresh_token 基本有效性
    ///
    /// Kiro IDE 会把被第三方读取的 refreshToken 截断为 `...` 结尾，
    /// 截断的 token 无法刷新，提前报错比打一次必失败的请求更清楚。
    pub fn validate_refresh_token(&self) -> Result<(), ProviderError> {
        let refresh_token = self
            .refresh_token
            .as_deref()
            .ok_or_else(|| ProviderError::LocalConfigError("missing refreshToken".to_string()))?;

        if refresh_token.trim().is_empty() {
            return Err(ProviderError::LocalConfigError(
                "empty refreshToken".to_string(),
            ));
        }

        if refresh_token.len() < 100 || refresh_token.contains("...") {
            return Err(ProviderError::LocalConfigError(format!(
                "refreshToken appears truncated (len={})",
                refresh_token.len()
            )));
        }

        Ok(())
    }
}

fn merge_credentials(target: &mut KiroCredentials, source: &KiroCredentials, allow_expiry: bool) {
    if source.access_token.is_some() {
        target.access_token = source.access_token.clone();
    }
    if source.refresh_token.is_some() {
        target.refresh_token = source.refresh_token.clone();
    }
    if source.client_id.is_some() {
        target.client_id = source.client_id.clone();
    }
    if source.client_secret.is_some() {
        target.client_secret = source.client_secret.clone();
    }
    if source.profile_arn.is_some() {
        target.profile_arn = source.profile_arn.clone();
    }
    if allow_expiry && source.expires_at.is_some() {
        target.expires_at = source.expires_at.clone();
    }
    if source.region.is_some() {
        target.region = source.region.clone();
    }
    if source.auth_method.is_some() {
        target.auth_method = source.auth_method.clone();
    }
}

/// Kiro 凭证存储
#[derive(Debug, Clone)]
pub struct KiroCredentialStore {
    path: PathBuf,
    /// 可选的 base64 凭证包（运维注入，优先级最低）
    base64_bundle: Option<String>,
}

impl KiroCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            base64_bundle: None,
        }
    }

    pub fn with_base64_bundle(mut self, bundle: Option<String>) -> Self {
        self.base64_bundle = bundle;
        self
    }

    /// 默认凭证文件路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".aws")
            .join("sso")
            .join("cache")
            .join("kiro-auth-token.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载并合并凭证
    ///
    /// 主文件缺失是致命错误（该适配器初始化失败），兄弟文件缺失
    /// 或不可解析则静默跳过。
    pub async fn load(&self) -> Result<KiroCredentials, ProviderError> {
        let mut merged = KiroCredentials::default();

        if let Some(bundle) = &self.base64_bundle {
            match BASE64
                .decode(bundle.trim())
                .ok()
                .and_then(|bytes| serde_json::from_slice::<KiroCredentials>(&bytes).ok())
            {
                Some(creds) => merge_credentials(&mut merged, &creds, true),
                None => {
                    tracing::warn!("[KIRO_STORE] base64 bundle unparseable, skipped");
                }
            }
        }

        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ProviderError::LocalConfigError(format!(
                "read credential file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let primary: KiroCredentials = serde_json::from_str(&content).map_err(|e| {
            ProviderError::LocalConfigError(format!(
                "parse credential file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        merge_credentials(&mut merged, &primary, true);

        // 兄弟 JSON 覆盖普通键；expiresAt 只信任主文件
        if let Some(dir) = self.path.parent() {
            if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let file_path = entry.path();
                    if file_path == self.path
                        || file_path.extension().map(|e| e != "json").unwrap_or(true)
                    {
                        continue;
                    }
                    if let Ok(content) = tokio::fs::read_to_string(&file_path).await {
                        if let Ok(creds) = serde_json::from_str::<KiroCredentials>(&content) {
                            merge_credentials(&mut merged, &creds, false);
                        }
                    }
                }
            }
        }

        if merged.region.is_none() {
            merged.region = Some("us-east-1".to_string());
        }

        tracing::debug!(
            "[KIRO_STORE] loaded {}: has_access={}, has_refresh={}, has_client_id={}, auth_method={}",
            self.path.display(),
            merged.access_token.is_some(),
            merged.refresh_token.is_some(),
            merged.client_id.is_some(),
            merged.auth_method()
        );

        Ok(merged)
    }

    /// 持久化刷新结果
    ///
    /// 只写回刷新会变化的键（accessToken/refreshToken/expiresAt/
    /// profileArn），其余字段保持磁盘原样，崩溃在中途也不会丢失
    /// 兄弟文件里的 clientId 布局。整个读-改-写在文件锁内完成。
    pub async fn persist_refresh(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<&str>,
        profile_arn: Option<&str>,
    ) -> Result<(), ProviderError> {
        let path = self.path.clone();
        let access_token = access_token.to_string();
        let refresh_token = refresh_token.map(|s| s.to_string());
        let expires_at = expires_at.map(|s| s.to_string());
        let profile_arn = profile_arn.map(|s| s.to_string());

        tokio::task::spawn_blocking(move || {
            let _guard = FileLockGuard::acquire(&path)?;

            let mut existing: serde_json::Value = match std::fs::read_to_string(&path) {
                Ok(content) => serde_json::from_str(&content)
                    .unwrap_or_else(|_| serde_json::json!({})),
                Err(_) => serde_json::json!({}),
            };

            existing["accessToken"] = serde_json::json!(access_token);
            if let Some(rt) = &refresh_token {
                existing["refreshToken"] = serde_json::json!(rt);
            }
            if let Some(exp) = &expires_at {
                existing["expiresAt"] = serde_json::json!(exp);
            }
            if let Some(arn) = &profile_arn {
                existing["profileArn"] = serde_json::json!(arn);
            }

            let content = serde_json::to_string_pretty(&existing)
                .map_err(|e| ProviderError::LocalConfigError(format!("serialize: {}", e)))?;

            let temp_path = path.with_extension("json.tmp");
            std::fs::write(&temp_path, content).map_err(|e| {
                let _ = std::fs::remove_file(&temp_path);
                ProviderError::LocalConfigError(format!("write temp credential file: {}", e))
            })?;
            std::fs::rename(&temp_path, &path).map_err(|e| {
                let _ = std::fs::remove_file(&temp_path);
                ProviderError::LocalConfigError(format!("replace credential file: {}", e))
            })?;

            Ok(())
        })
        .await
        .map_err(|e| ProviderError::LocalConfigError(format!("persist task: {}", e)))?
    }
}

/// 凭证文件旁的咨询锁
///
/// 锁在 `<file>.lock` 上而不是凭证文件本身，原子 rename 之后锁的
/// 文件身份才不会失效。Drop 时解锁。
struct FileLockGuard {
    file: std::fs::File,
}

impl FileLockGuard {
    fn acquire(target: &Path) -> Result<Self, ProviderError> {
        let lock_path = target.with_extension("json.lock");
        if let Some(parent) = lock_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                ProviderError::LocalConfigError(format!(
                    "open lock file {}: {}",
                    lock_path.display(),
                    e
                ))
            })?;
        file.lock_exclusive().map_err(|e| {
            ProviderError::LocalConfigError(format!("lock {}: {}", lock_path.display(), e))
        })?;
        Ok(Self { file })
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_json(dir: &TempDir, name: &str, value: serde_json::Value) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_load_primary_only() {
        let dir = TempDir::new().unwrap();
        let path = write_json(
            &dir,
            "kiro-auth-token.json",
            serde_json::json!({
                "accessToken": "at-1",
                "refreshToken": "rt-1",
                "expiresAt": "2030-01-01T00:00:00Z"
            }),
        );

        let store = KiroCredentialStore::new(&path);
        let creds = store.load().await.unwrap();
        assert_eq!(creds.access_token.as_deref(), Some("at-1"));
        assert_eq!(creds.region(), "us-east-1");
        assert_eq!(creds.auth_method(), "social");
    }

    #[tokio::test]
    async fn test_load_missing_primary_is_config_error() {
        let dir = TempDir::new().unwrap();
        let store = KiroCredentialStore::new(dir.path().join("absent.json"));
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, ProviderError::LocalConfigError(_)));
    }

    #[tokio::test]
    async fn test_sibling_merge_keeps_primary_expiry() {
        let dir = TempDir::new().unwrap();
        let path = write_json(
            &dir,
            "kiro-auth-token.json",
            serde_json::json!({
                "accessToken": "at-1",
                "refreshToken": "rt-1",
                "expiresAt": "2030-01-01T00:00:00Z"
            }),
        );
        write_json(
            &dir,
            "a1b2c3.json",
            serde_json::json!({
                "clientId": "client-1",
                "clientSecret": "secret-1",
                "expiresAt": "1999-01-01T00:00:00Z"
            }),
        );

        let creds = KiroCredentialStore::new(&path).load().await.unwrap();
        assert_eq!(creds.client_id.as_deref(), Some("client-1"));
        assert_eq!(creds.client_secret.as_deref(), Some("secret-1"));
        // expiresAt 必须来自主文件
        assert_eq!(creds.expires_at.as_deref(), Some("2030-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_sibling_merge_skips_unparseable() {
        let dir = TempDir::new().unwrap();
        let path = write_json(
            &dir,
            "kiro-auth-token.json",
            serde_json::json!({"accessToken": "at-1"}),
        );
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let creds = KiroCredentialStore::new(&path).load().await.unwrap();
        assert_eq!(creds.access_token.as_deref(), Some("at-1"));
    }

    #[tokio::test]
    async fn test_base64_bundle_lowest_priority() {
        let dir = TempDir::new().unwrap();
        let path = write_json(
            &dir,
            "kiro-auth-token.json",
            serde_json::json!({"accessToken": "from-file"}),
        );
        let bundle = BASE64.encode(
            serde_json::to_vec(&serde_json::json!({
                "accessToken": "from-bundle",
                "region": "eu-west-1"
            }))
            .unwrap(),
        );

        let creds = KiroCredentialStore::new(&path)
            .with_base64_bundle(Some(bundle))
            .load()
            .await
            .unwrap();
        // 文件覆盖 bundle，bundle 提供文件缺失的键
        assert_eq!(creds.access_token.as_deref(), Some("from-file"));
        assert_eq!(creds.region(), "eu-west-1");
    }

    #[tokio::test]
    async fn test_persist_refresh_preserves_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let path = write_json(
            &dir,
            "kiro-auth-token.json",
            serde_json::json!({
                "accessToken": "old",
                "authMethod": "idc",
                "customField": "keep-me"
            }),
        );

        let store = KiroCredentialStore::new(&path);
        store
            .persist_refresh("new-at", Some("new-rt"), Some("2030-01-01T00:00:00Z"), None)
            .await
            .unwrap();

        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["accessToken"], "new-at");
        assert_eq!(on_disk["refreshToken"], "new-rt");
        assert_eq!(on_disk["expiresAt"], "2030-01-01T00:00:00Z");
        assert_eq!(on_disk["customField"], "keep-me");
        assert_eq!(on_disk["authMethod"], "idc");
    }

    #[tokio::test]
    async fn test_persist_refresh_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh.json");
        let store = KiroCredentialStore::new(&path);
        store
            .persist_refresh("at", None, None, Some("arn:p/1"))
            .await
            .unwrap();

        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["accessToken"], "at");
        assert_eq!(on_disk["profileArn"], "arn:p/1");
    }

    #[test]
    fn test_expiry_window() {
        let mut creds = KiroCredentials::default();
        assert!(creds.is_expiring_within_minutes(10), "no expiry means refresh");

        creds.expires_at = Some((Utc::now() + Duration::minutes(5)).to_rfc3339());
        assert!(creds.is_expiring_within_minutes(10));

        creds.expires_at = Some((Utc::now() + Duration::minutes(30)).to_rfc3339());
        assert!(!creds.is_expiring_within_minutes(10));
    }

    #[test]
    fn test_validate_refresh_token_truncated() {
        let mut creds = KiroCredentials::default();
        assert!(creds.validate_refresh_token().is_err());

        creds.refresh_token = Some("short...".to_string());
        assert!(creds.validate_refresh_token().is_err());

        creds.refresh_token = Some("x".repeat(600));
        assert!(creds.validate_refresh_token().is_ok());
    }
}
