//! Provider Pool 管理服务
//!
//! 凭证池的唯一权威：选择（LRU + 粘性会话）、两级回退、健康状态
//! 变更、周期探活、去抖持久化与销毁。适配器只通过
//! `mark_provider_unhealthy[_immediately]` 发信号，不直接改状态。

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;

use crate::config::{ModelFallbackTarget, PoolConfig};
use crate::models::provider_pool_model::{
    get_default_check_model, PoolStats, ProviderCredential, ProviderPools,
};
use crate::providers::HealthProbe;
use crate::services::pool_persistence_service::PoolPersistenceService;
use crate::services::sticky_session_service::StickySessionService;
use crate::ProviderType;

/// 不健康凭证的探活退避窗口
const HEALTH_CHECK_BACKOFF_SECONDS: i64 = 120;

/// 选择参数
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// 会话 id，启用粘性会话时用于绑定
    pub session_id: Option<String>,
    /// 不计入使用统计（探活等内部调用）
    pub skip_usage_count: bool,
    /// 回退调用：不覆盖主类型的粘性绑定
    pub is_from_fallback: bool,
}

/// 回退选择结果
#[derive(Debug, Clone)]
pub struct FallbackSelection {
    pub credential: ProviderCredential,
    pub actual_provider_type: ProviderType,
    pub is_fallback: bool,
    /// 模型映射命中时的目标模型，调用方需改写请求体
    pub actual_model: Option<String>,
}

/// 凭证池管理服务
pub struct ProviderPoolService {
    pools: Arc<RwLock<ProviderPools>>,
    sticky: Arc<StickySessionService>,
    persistence: Arc<PoolPersistenceService>,
    probe: Arc<dyn HealthProbe>,
    max_error_count: u32,
    fallback_chain: StdRwLock<HashMap<ProviderType, Vec<ProviderType>>>,
    model_fallback_mapping: HashMap<String, ModelFallbackTarget>,
    cleanup_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProviderPoolService {
    pub fn new(config: PoolConfig, probe: Arc<dyn HealthProbe>) -> Arc<Self> {
        let pools: Arc<RwLock<ProviderPools>> = Arc::new(RwLock::new(ProviderPools::new()));
        let sticky = Arc::new(StickySessionService::new(config.sticky_session.clone()));
        let persistence = PoolPersistenceService::new(
            &config.pool_file_path,
            StdDuration::from_millis(config.save_debounce_ms),
            pools.clone(),
        );

        let service = Arc::new(Self {
            pools,
            sticky: sticky.clone(),
            persistence,
            probe,
            max_error_count: config.max_error_count,
            fallback_chain: StdRwLock::new(config.provider_fallback_chain.clone()),
            model_fallback_mapping: config.model_fallback_mapping.clone(),
            cleanup_task: StdMutex::new(None),
        });

        // 粘性会话周期清理
        let cleanup_interval =
            StdDuration::from_millis(config.sticky_session.cleanup_interval_ms.max(1000));
        let sticky_for_task = sticky.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sticky_for_task.cleanup_expired();
            }
        });
        *service.cleanup_task.lock().unwrap() = Some(handle);

        service
    }

    pub fn sticky_sessions(&self) -> &StickySessionService {
        &self.sticky
    }

    /// 注入凭证（初始化或运维添加）
    pub async fn add_credential(&self, credential: ProviderCredential) {
        let provider_type = credential.provider_type;
        self.pools
            .write()
            .await
            .entry(provider_type)
            .or_default()
            .push(credential);
        self.persistence.schedule_save(provider_type);
    }

    /// 选择一个可用凭证
    ///
    /// 顺序：粘性绑定 → 健康/未禁用过滤 → 模型过滤 →
    /// `(last_used, usage_count)` 最小者（确定性 LRU，新凭证优先）。
    pub async fn select_provider(
        &self,
        provider_type: &str,
        model: Option<&str>,
        options: SelectOptions,
    ) -> Option<ProviderCredential> {
        if provider_type.is_empty() {
            tracing::warn!("[POOL] select rejected: empty provider type");
            return None;
        }
        let pt: ProviderType = match provider_type.parse() {
            Ok(pt) => pt,
            Err(e) => {
                tracing::warn!("[POOL] select rejected: {}", e);
                return None;
            }
        };

        let mut pools = self.pools.write().await;
        let credentials = pools.entry(pt).or_default();

        // 1. 粘性绑定
        let mut sticky_bypass_bind = false;
        if self.sticky.enabled() {
            if let Some(session_id) = options.session_id.as_deref() {
                if let Some(binding) = self.sticky.get(session_id) {
                    if binding.provider_type == pt {
                        if let Some(bound) =
                            credentials.iter_mut().find(|c| c.uuid == binding.uuid)
                        {
                            let model_ok =
                                model.map(|m| bound.supports_model(m)).unwrap_or(true);
                            if bound.is_available() && model_ok {
                                if !options.skip_usage_count {
                                    bound.record_usage_at(Utc::now());
                                    let selected = bound.clone();
                                    drop(pools);
                                    self.persistence.schedule_save(pt);
                                    return Some(selected);
                                }
                                return Some(bound.clone());
                            }
                            if bound.is_available() && !model_ok {
                                // 仅模型不支持：本次绕过粘性，保留绑定
                                sticky_bypass_bind = true;
                            } else {
                                tracing::debug!(
                                    "[POOL] sticky binding {} -> {} no longer eligible, dropped",
                                    session_id,
                                    binding.uuid
                                );
                                self.sticky.remove(session_id);
                            }
                        } else {
                            self.sticky.remove(session_id);
                        }
                    } else {
                        self.sticky.remove(session_id);
                    }
                }
            }
        }

        // 2/3. 过滤 + LRU
        let selected_idx = credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_available())
            .filter(|(_, c)| model.map(|m| c.supports_model(m)).unwrap_or(true))
            .min_by_key(|(_, c)| c.lru_key())
            .map(|(i, _)| i)?;

        let now = Utc::now();
        let selected = {
            let cred = &mut credentials[selected_idx];
            if !options.skip_usage_count {
                cred.record_usage_at(now);
            }
            cred.clone()
        };
        drop(pools);

        // 4. 记录粘性绑定（回退选择不覆盖主绑定）
        if !options.is_from_fallback && !sticky_bypass_bind && self.sticky.enabled() {
            if let Some(session_id) = options.session_id.as_deref() {
                self.sticky.bind(session_id, pt, &selected.uuid);
            }
        }

        // 5. 去抖持久化
        if !options.skip_usage_count {
            self.persistence.schedule_save(pt);
        }

        Some(selected)
    }

    /// 两级回退选择
    ///
    /// 第一级：同协议回退链（候选必须与主类型同协议前缀且支持
    /// 请求模型）。第二级：模型映射跨协议重定向，命中后先试目标
    /// 池，再试目标自身的回退链，不再递归模型映射。
    pub async fn select_provider_with_fallback(
        &self,
        provider_type: &str,
        model: Option<&str>,
        options: SelectOptions,
    ) -> Option<FallbackSelection> {
        let primary: ProviderType = provider_type.parse().ok()?;

        let mut tried: Vec<ProviderType> = Vec::new();

        // 第一级：主类型 + 同协议链
        let chain = self.get_fallback_chain(primary);
        let mut candidates = vec![primary];
        candidates.extend(chain);

        for candidate in candidates {
            if tried.contains(&candidate) {
                continue;
            }
            tried.push(candidate);

            if candidate != primary
                && candidate.protocol_prefix() != primary.protocol_prefix()
            {
                tracing::debug!(
                    "[POOL] fallback candidate {} skipped: protocol mismatch with {}",
                    candidate,
                    primary
                );
                continue;
            }
            if candidate != primary {
                if let Some(m) = model {
                    if !self.pool_supports_model(candidate, m).await {
                        continue;
                    }
                }
            }

            let opts = SelectOptions {
                is_from_fallback: candidate != primary || options.is_from_fallback,
                ..options.clone()
            };
            if let Some(credential) = self
                .select_provider(&candidate.to_string(), model, opts)
                .await
            {
                return Some(FallbackSelection {
                    credential,
                    actual_provider_type: candidate,
                    is_fallback: candidate != primary,
                    actual_model: None,
                });
            }
        }

        // 第二级：模型映射
        let mapping = model.and_then(|m| self.model_fallback_mapping.get(m))?;
        let target_type = mapping.provider_type;
        let target_model = mapping.model.clone();

        let mut targets = vec![target_type];
        targets.extend(self.get_fallback_chain(target_type));

        for candidate in targets {
            if tried.contains(&candidate) {
                continue;
            }
            tried.push(candidate);

            if candidate != target_type
                && candidate.protocol_prefix() != target_type.protocol_prefix()
            {
                continue;
            }
            if candidate != target_type
                && !self.pool_supports_model(candidate, &target_model).await
            {
                continue;
            }

            let opts = SelectOptions {
                is_from_fallback: true,
                ..options.clone()
            };
            if let Some(credential) = self
                .select_provider(&candidate.to_string(), Some(&target_model), opts)
                .await
            {
                tracing::info!(
                    "[POOL] model fallback: {} -> {} ({})",
                    model.unwrap_or(""),
                    target_model,
                    candidate
                );
                return Some(FallbackSelection {
                    credential,
                    actual_provider_type: candidate,
                    is_fallback: true,
                    actual_model: Some(target_model.clone()),
                });
            }
        }

        None
    }

    /// 候选池中是否存在支持该模型的可用凭证
    async fn pool_supports_model(&self, pt: ProviderType, model: &str) -> bool {
        self.pools
            .read()
            .await
            .get(&pt)
            .map(|creds| {
                creds
                    .iter()
                    .any(|c| c.is_available() && c.supports_model(model))
            })
            .unwrap_or(false)
    }

    /// 记录一次错误（10 秒窗口计数），达到阈值自动不健康
    pub async fn mark_provider_unhealthy(
        &self,
        provider_type: ProviderType,
        uuid: &str,
        error_message: Option<&str>,
    ) {
        let mut pools = self.pools.write().await;
        if let Some(cred) = pools
            .get_mut(&provider_type)
            .and_then(|creds| creds.iter_mut().find(|c| c.uuid == uuid))
        {
            cred.record_error_at(
                Utc::now(),
                self.max_error_count,
                error_message.map(|s| s.to_string()),
            );
            if !cred.is_healthy {
                tracing::warn!(
                    "[POOL] credential {} ({}) marked unhealthy after {} errors: {:?}",
                    uuid,
                    provider_type,
                    cred.error_count,
                    error_message
                );
            }
        }
        drop(pools);
        self.persistence.schedule_save(provider_type);
    }

    /// 立即标记不健康（401 刷新失败、403）
    pub async fn mark_provider_unhealthy_immediately(
        &self,
        provider_type: ProviderType,
        uuid: &str,
        error_message: Option<&str>,
    ) {
        let mut pools = self.pools.write().await;
        if let Some(cred) = pools
            .get_mut(&provider_type)
            .and_then(|creds| creds.iter_mut().find(|c| c.uuid == uuid))
        {
            cred.force_unhealthy_at(
                Utc::now(),
                self.max_error_count,
                error_message.map(|s| s.to_string()),
            );
            tracing::warn!(
                "[POOL] credential {} ({}) marked unhealthy immediately: {:?}",
                uuid,
                provider_type,
                error_message
            );
        }
        drop(pools);
        self.persistence.schedule_save(provider_type);
    }

    /// 标记健康（探活恢复时 reset_usage=true）
    pub async fn mark_provider_healthy(
        &self,
        provider_type: ProviderType,
        uuid: &str,
        reset_usage: bool,
        health_check_model: Option<&str>,
    ) {
        let mut pools = self.pools.write().await;
        if let Some(cred) = pools
            .get_mut(&provider_type)
            .and_then(|creds| creds.iter_mut().find(|c| c.uuid == uuid))
        {
            cred.mark_healthy_at(
                Utc::now(),
                reset_usage,
                health_check_model.map(|s| s.to_string()),
            );
        }
        drop(pools);
        self.persistence.schedule_save(provider_type);
    }

    /// 禁用凭证（仅运维操作；粘性绑定在下次访问时自然失效）
    pub async fn disable_provider(&self, provider_type: ProviderType, uuid: &str) {
        self.set_disabled(provider_type, uuid, true).await;
    }

    /// 启用凭证（保留禁用前的健康状态）
    pub async fn enable_provider(&self, provider_type: ProviderType, uuid: &str) {
        self.set_disabled(provider_type, uuid, false).await;
    }

    async fn set_disabled(&self, provider_type: ProviderType, uuid: &str, disabled: bool) {
        let mut pools = self.pools.write().await;
        if let Some(cred) = pools
            .get_mut(&provider_type)
            .and_then(|creds| creds.iter_mut().find(|c| c.uuid == uuid))
        {
            cred.is_disabled = disabled;
        }
        drop(pools);
        self.persistence.schedule_save(provider_type);
    }

    /// 重置指定类型所有凭证的健康状态，返回重置数量
    pub async fn reset_health_by_type(&self, provider_type: ProviderType) -> usize {
        let mut pools = self.pools.write().await;
        let count = match pools.get_mut(&provider_type) {
            Some(creds) => {
                for cred in creds.iter_mut() {
                    cred.is_healthy = true;
                    cred.error_count = 0;
                    cred.last_error_time = None;
                    cred.last_error_message = None;
                }
                creds.len()
            }
            None => 0,
        };
        drop(pools);
        self.persistence.schedule_save(provider_type);
        count
    }

    /// 重置凭证计数器
    pub async fn reset_provider_counters(&self, provider_type: ProviderType, uuid: &str) {
        let mut pools = self.pools.write().await;
        if let Some(cred) = pools
            .get_mut(&provider_type)
            .and_then(|creds| creds.iter_mut().find(|c| c.uuid == uuid))
        {
            cred.reset_counters();
        }
        drop(pools);
        self.persistence.schedule_save(provider_type);
    }

    /// 池统计
    pub async fn get_provider_stats(&self, provider_type: ProviderType) -> PoolStats {
        let pools = self.pools.read().await;
        PoolStats::from_credentials(pools.get(&provider_type).map(|v| v.as_slice()).unwrap_or(&[]))
    }

    /// 池非空且全部不可用
    pub async fn is_all_providers_unhealthy(&self, provider_type: ProviderType) -> bool {
        let pools = self.pools.read().await;
        pools
            .get(&provider_type)
            .map(|creds| !creds.is_empty() && creds.iter().all(|c| !c.is_available()))
            .unwrap_or(false)
    }

    pub fn get_fallback_chain(&self, provider_type: ProviderType) -> Vec<ProviderType> {
        self.fallback_chain
            .read()
            .unwrap()
            .get(&provider_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_fallback_chain(&self, provider_type: ProviderType, chain: Vec<ProviderType>) {
        self.fallback_chain
            .write()
            .unwrap()
            .insert(provider_type, chain);
    }

    /// 探活扫描
    ///
    /// 健康凭证由真实流量隐式验证，跳过；不健康凭证距上次错误
    /// 不足 2 分钟也跳过（初始化扫描除外）。探活成功转为健康并
    /// 清零使用计数；失败走窗口计数。检查时间/模型无论成败都记。
    pub async fn perform_health_checks(&self, is_init: bool) {
        let snapshot: Vec<ProviderCredential> = {
            let pools = self.pools.read().await;
            pools.values().flatten().cloned().collect()
        };

        for cred in snapshot {
            if cred.is_disabled || !cred.check_health || cred.is_healthy {
                continue;
            }

            if !is_init {
                let in_backoff = cred
                    .last_error_time
                    .map(|t| Utc::now() - t < Duration::seconds(HEALTH_CHECK_BACKOFF_SECONDS))
                    .unwrap_or(false);
                if in_backoff {
                    continue;
                }
            }

            let model = cred
                .check_model_name
                .clone()
                .unwrap_or_else(|| get_default_check_model(cred.provider_type).to_string());

            tracing::info!(
                "[HEALTH] probing {} ({}) with model {}",
                cred.uuid,
                cred.provider_type,
                model
            );

            match self.probe.probe(&cred, &model).await {
                Ok(()) => {
                    self.mark_provider_healthy(cred.provider_type, &cred.uuid, true, Some(&model))
                        .await;
                    tracing::info!("[HEALTH] {} recovered", cred.uuid);
                }
                Err(e) => {
                    let reason = e.short_reason();
                    self.mark_provider_unhealthy(
                        cred.provider_type,
                        &cred.uuid,
                        Some(&reason),
                    )
                    .await;
                    // 失败也记录检查时间与模型
                    let mut pools = self.pools.write().await;
                    if let Some(c) = pools
                        .get_mut(&cred.provider_type)
                        .and_then(|creds| creds.iter_mut().find(|c| c.uuid == cred.uuid))
                    {
                        c.last_health_check_time = Some(Utc::now());
                        c.last_health_check_model = Some(model.clone());
                    }
                    tracing::warn!("[HEALTH] {} still failing: {}", cred.uuid, reason);
                }
            }
        }
    }

    /// 销毁：取消去抖持久化与会话清理任务，清空会话表。
    /// 在途请求不受影响。
    pub fn destroy(&self) {
        self.persistence.destroy();
        if let Some(handle) = self.cleanup_task.lock().unwrap().take() {
            handle.abort();
        }
        self.sticky.clear();
    }
}

impl Drop for ProviderPoolService {
    fn drop(&mut self) {
        self.destroy();
    }
}
