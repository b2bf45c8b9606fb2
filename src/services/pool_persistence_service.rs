//! 凭证池去抖持久化
//!
//! 把零散的状态变更合并为一次池文件写入：变更方把受影响的
//! providerType 投入待写集合并重置计时器（默认 1 秒），计时器
//! 到点后读取磁盘现状，仅替换待写类型，整体重写文件。
//! 文件里本服务不认识的 provider 类型原样保留；日期一律
//! RFC3339。跨进程写入不在本层协调。

use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use crate::models::provider_pool_model::ProviderPools;
use crate::ProviderType;

/// 去抖持久化服务
pub struct PoolPersistenceService {
    path: PathBuf,
    pools: Arc<RwLock<ProviderPools>>,
    pending: Arc<StdMutex<HashSet<ProviderType>>>,
    tx: mpsc::UnboundedSender<()>,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PoolPersistenceService {
    pub fn new(
        path: impl Into<PathBuf>,
        debounce: Duration,
        pools: Arc<RwLock<ProviderPools>>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let service = Arc::new(Self {
            path: path.into(),
            pools,
            pending: Arc::new(StdMutex::new(HashSet::new())),
            tx,
            task: StdMutex::new(None),
        });

        let weak = Arc::downgrade(&service);
        let handle = tokio::spawn(async move {
            loop {
                if rx.recv().await.is_none() {
                    return;
                }
                // 收到首个变更信号后开始去抖窗口；窗口内的新信号重置计时
                loop {
                    tokio::select! {
                        more = rx.recv() => {
                            if more.is_none() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(debounce) => break,
                    }
                }
                match weak.upgrade() {
                    Some(service) => {
                        if let Err(e) = service.flush_now().await {
                            tracing::warn!("[PERSIST] pool file flush failed: {}", e);
                        }
                    }
                    None => return,
                }
            }
        });
        *service.task.lock().unwrap() = Some(handle);

        service
    }

    /// 登记一个待持久化的类型并（重新）武装计时器
    pub fn schedule_save(&self, provider_type: ProviderType) {
        self.pending.lock().unwrap().insert(provider_type);
        let _ = self.tx.send(());
    }

    /// 立即落盘：读-改-写，只替换待写集合里的类型
    pub async fn flush_now(&self) -> Result<(), String> {
        let pending: Vec<ProviderType> = {
            let mut guard = self.pending.lock().unwrap();
            guard.drain().collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let snapshot: ProviderPools = self.pools.read().await.clone();

        // ENOENT 视为空文件
        let mut on_disk: Value = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("[PERSIST] pool file unparseable, rewriting: {}", e);
                Value::Object(serde_json::Map::new())
            }),
            Err(_) => Value::Object(serde_json::Map::new()),
        };
        if !on_disk.is_object() {
            on_disk = Value::Object(serde_json::Map::new());
        }

        for pt in &pending {
            let creds = snapshot.get(pt).cloned().unwrap_or_default();
            on_disk[pt.to_string()] =
                serde_json::to_value(creds).map_err(|e| format!("serialize pool: {}", e))?;
        }

        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let content = serde_json::to_string_pretty(&on_disk)
            .map_err(|e| format!("serialize pool file: {}", e))?;
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| format!("write pool temp file: {}", e))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| format!("replace pool file: {}", e))?;

        tracing::debug!(
            "[PERSIST] pool file updated for {} provider types",
            pending.len()
        );
        Ok(())
    }

    /// 取消去抖任务（destroy 路径）
    pub fn destroy(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for PoolPersistenceService {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider_pool_model::{CredentialData, ProviderCredential};
    use tempfile::TempDir;

    fn kiro_credential() -> ProviderCredential {
        ProviderCredential::new(
            ProviderType::ClaudeKiroOAuth,
            CredentialData::KiroOAuth {
                creds_file_path: "/tmp/creds.json".to_string(),
            },
        )
    }

    async fn pools_with_kiro() -> Arc<RwLock<ProviderPools>> {
        let mut pools = ProviderPools::new();
        pools.insert(ProviderType::ClaudeKiroOAuth, vec![kiro_credential()]);
        Arc::new(RwLock::new(pools))
    }

    #[tokio::test]
    async fn test_flush_writes_pending_types() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("provider_pools.json");
        let pools = pools_with_kiro().await;
        let service =
            PoolPersistenceService::new(&path, Duration::from_millis(50), pools.clone());

        service.schedule_save(ProviderType::ClaudeKiroOAuth);
        service.flush_now().await.unwrap();

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["claude-kiro-oauth"].as_array().unwrap().len(), 1);
        service.destroy();
    }

    #[tokio::test]
    async fn test_flush_without_pending_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("provider_pools.json");
        let service = PoolPersistenceService::new(
            &path,
            Duration::from_millis(50),
            pools_with_kiro().await,
        );

        service.flush_now().await.unwrap();
        assert!(!path.exists());
        service.destroy();
    }

    #[tokio::test]
    async fn test_foreign_types_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("provider_pools.json");
        std::fs::write(
            &path,
            r#"{"some-foreign-provider": [{"anything": true}]}"#,
        )
        .unwrap();

        let service = PoolPersistenceService::new(
            &path,
            Duration::from_millis(50),
            pools_with_kiro().await,
        );
        service.schedule_save(ProviderType::ClaudeKiroOAuth);
        service.flush_now().await.unwrap();

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["some-foreign-provider"][0]["anything"], true);
        assert!(on_disk["claude-kiro-oauth"].is_array());
        service.destroy();
    }

    #[tokio::test]
    async fn test_dates_serialized_rfc3339() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("provider_pools.json");

        let mut cred = kiro_credential();
        cred.record_usage_at(chrono::Utc::now());
        let mut pools = ProviderPools::new();
        pools.insert(ProviderType::ClaudeKiroOAuth, vec![cred]);
        let pools = Arc::new(RwLock::new(pools));

        let service = PoolPersistenceService::new(&path, Duration::from_millis(50), pools);
        service.schedule_save(ProviderType::ClaudeKiroOAuth);
        service.flush_now().await.unwrap();

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let last_used = on_disk["claude-kiro-oauth"][0]["last_used"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(last_used).is_ok());
        service.destroy();
    }

    #[tokio::test]
    async fn test_debounced_write_fires_after_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("provider_pools.json");
        let service = PoolPersistenceService::new(
            &path,
            Duration::from_millis(30),
            pools_with_kiro().await,
        );

        service.schedule_save(ProviderType::ClaudeKiroOAuth);
        assert!(!path.exists());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(path.exists());
        service.destroy();
    }
}
