//! 账号级估算器注册表
//!
//! 不同凭证看到的是不同的上游缓存，估算器必须按账号隔离；
//! 全局再套一层 LRU（上限 100 账号，1 小时 TTL）防止内存无界。

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::estimator::CacheEstimator;

/// 账号上限
const MAX_ACCOUNTS: usize = 100;
/// 账号条目 TTL
const ACCOUNT_TTL_MINUTES: i64 = 60;

struct AccountEntry {
    estimator: Arc<Mutex<CacheEstimator>>,
    last_accessed: DateTime<Utc>,
}

/// 估算器注册表
#[derive(Default)]
pub struct CacheEstimatorRegistry {
    accounts: DashMap<String, AccountEntry>,
}

impl CacheEstimatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// 取出（或创建）账号的估算器
    pub fn for_account(&self, account_id: &str) -> Arc<Mutex<CacheEstimator>> {
        self.evict_stale();

        let now = Utc::now();
        let estimator = {
            let mut entry = self
                .accounts
                .entry(account_id.to_string())
                .or_insert_with(|| AccountEntry {
                    estimator: Arc::new(Mutex::new(CacheEstimator::new())),
                    last_accessed: now,
                });
            entry.last_accessed = now;
            entry.estimator.clone()
        };

        estimator
    }

    /// 淘汰过期账号；超量时按最久未访问淘汰
    fn evict_stale(&self) {
        let now = Utc::now();
        let ttl = Duration::minutes(ACCOUNT_TTL_MINUTES);
        self.accounts.retain(|_, e| now - e.last_accessed <= ttl);

        while self.accounts.len() > MAX_ACCOUNTS {
            let oldest = self
                .accounts
                .iter()
                .min_by_key(|e| e.value().last_accessed)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.accounts.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_account_shares_estimator() {
        let registry = CacheEstimatorRegistry::new();
        let a = registry.for_account("acc-1");
        let b = registry.for_account("acc-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.account_count(), 1);
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let registry = CacheEstimatorRegistry::new();
        let a = registry.for_account("acc-1");
        let b = registry.for_account("acc-2");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.account_count(), 2);
    }

    #[tokio::test]
    async fn test_account_cap() {
        let registry = CacheEstimatorRegistry::new();
        for i in 0..(MAX_ACCOUNTS + 20) {
            registry.for_account(&format!("acc-{}", i));
        }
        assert!(registry.account_count() <= MAX_ACCOUNTS + 1);
    }
}
