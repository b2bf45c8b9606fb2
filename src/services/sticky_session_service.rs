//! 粘性会话表
//!
//! sessionId → (providerType, 凭证 uuid) 的映射，让同一会话的
//! 请求固定落在同一凭证上（提示词缓存命中率依赖这一点）。
//! 生命周期：首次选择时建立，每次命中刷新；TTL 过期、绑定凭证
//! 不健康/被禁用、或会话总数超限（按 LRU 批量淘汰 10%）时移除。
//! 缺失或过期的绑定静默退化为 LRU 选择，从不报错。

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::config::StickySessionConfig;
use crate::ProviderType;

/// 会话绑定
#[derive(Debug, Clone)]
pub struct StickySession {
    pub provider_type: ProviderType,
    pub uuid: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub request_count: u64,
}

/// 粘性会话服务
pub struct StickySessionService {
    sessions: DashMap<String, StickySession>,
    config: StickySessionConfig,
}

impl StickySessionService {
    pub fn new(config: StickySessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 查询会话绑定，命中时刷新访问时间
    ///
    /// 过期的绑定当场移除并返回 None。
    pub fn get(&self, session_id: &str) -> Option<StickySession> {
        let now = Utc::now();
        let ttl = Duration::milliseconds(self.config.ttl_ms as i64);

        let expired = match self.sessions.get(session_id) {
            Some(entry) => now - entry.last_accessed_at > ttl,
            None => return None,
        };

        if expired {
            self.sessions.remove(session_id);
            tracing::debug!("[STICKY] session {} expired", session_id);
            return None;
        }

        self.sessions.get_mut(session_id).map(|mut entry| {
            entry.last_accessed_at = now;
            entry.request_count += 1;
            entry.clone()
        })
    }

    /// 建立或覆盖绑定
    pub fn bind(&self, session_id: &str, provider_type: ProviderType, uuid: &str) {
        let now = Utc::now();
        self.sessions.insert(
            session_id.to_string(),
            StickySession {
                provider_type,
                uuid: uuid.to_string(),
                created_at: now,
                last_accessed_at: now,
                request_count: 0,
            },
        );

        if self.sessions.len() > self.config.max_sessions {
            self.evict_lru_batch();
        }
    }

    /// 删除绑定（凭证失效、会话显式结束）
    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// 清理过期会话，返回移除数量
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = Duration::milliseconds(self.config.ttl_ms as i64);
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now - s.last_accessed_at <= ttl);
        let removed = before - self.sessions.len();
        if removed > 0 {
            tracing::debug!("[STICKY] cleaned {} expired sessions", removed);
        }
        removed
    }

    /// 超限时按 LRU 淘汰 ⌊max × 0.1⌋ 条
    fn evict_lru_batch(&self) {
        let batch = self.config.max_sessions / 10;
        if batch == 0 {
            return;
        }

        let mut entries: Vec<(String, DateTime<Utc>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().last_accessed_at))
            .collect();
        entries.sort_by_key(|(_, t)| *t);

        for (key, _) in entries.into_iter().take(batch) {
            self.sessions.remove(&key);
        }
        tracing::debug!("[STICKY] evicted {} LRU sessions over cap", batch);
    }

    /// 清空（destroy 路径）
    pub fn clear(&self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ttl_ms: u64, max_sessions: usize) -> StickySessionConfig {
        StickySessionConfig {
            enabled: true,
            ttl_ms,
            cleanup_interval_ms: 60_000,
            max_sessions,
        }
    }

    #[test]
    fn test_bind_and_get() {
        let svc = StickySessionService::new(config(60_000, 100));
        svc.bind("s1", ProviderType::ClaudeKiroOAuth, "cred-a");

        let session = svc.get("s1").unwrap();
        assert_eq!(session.provider_type, ProviderType::ClaudeKiroOAuth);
        assert_eq!(session.uuid, "cred-a");
        assert_eq!(session.request_count, 1);

        let session = svc.get("s1").unwrap();
        assert_eq!(session.request_count, 2);
    }

    #[test]
    fn test_missing_session_is_none() {
        let svc = StickySessionService::new(config(60_000, 100));
        assert!(svc.get("absent").is_none());
    }

    #[test]
    fn test_expired_session_removed_on_access() {
        let svc = StickySessionService::new(config(0, 100));
        svc.bind("s1", ProviderType::ClaudeKiroOAuth, "cred-a");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(svc.get("s1").is_none());
        assert_eq!(svc.session_count(), 0);
    }

    #[test]
    fn test_rebind_overwrites() {
        let svc = StickySessionService::new(config(60_000, 100));
        svc.bind("s1", ProviderType::ClaudeKiroOAuth, "cred-a");
        svc.bind("s1", ProviderType::ClaudeCustom, "cred-b");
        let session = svc.get("s1").unwrap();
        assert_eq!(session.uuid, "cred-b");
        assert_eq!(svc.session_count(), 1);
    }

    #[test]
    fn test_cleanup_expired() {
        let svc = StickySessionService::new(config(0, 100));
        svc.bind("s1", ProviderType::ClaudeKiroOAuth, "a");
        svc.bind("s2", ProviderType::ClaudeKiroOAuth, "b");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(svc.cleanup_expired(), 2);
        assert_eq!(svc.session_count(), 0);
    }

    #[test]
    fn test_overflow_evicts_exactly_ten_percent() {
        let svc = StickySessionService::new(config(60_000, 50));
        for i in 0..=50 {
            svc.bind(&format!("s{}", i), ProviderType::ClaudeKiroOAuth, "a");
        }
        // 超限触发一次淘汰：51 - ⌊50×0.1⌋ = 46
        assert_eq!(svc.session_count(), 46);
    }

    #[test]
    fn test_eviction_removes_lru_tail() {
        let svc = StickySessionService::new(config(60_000, 10));
        for i in 0..10 {
            svc.bind(&format!("s{}", i), ProviderType::ClaudeKiroOAuth, "a");
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        // 刷新 s0，使它不再是最旧
        svc.get("s0").unwrap();
        svc.bind("s10", ProviderType::ClaudeKiroOAuth, "a");

        // 淘汰 1 条（10 的 10%），最旧的 s1 应被移除
        assert!(svc.get("s0").is_some());
        assert!(svc.get("s1").is_none());
    }

    #[test]
    fn test_clear() {
        let svc = StickySessionService::new(config(60_000, 100));
        svc.bind("s1", ProviderType::ClaudeKiroOAuth, "a");
        svc.clear();
        assert_eq!(svc.session_count(), 0);
    }
}
