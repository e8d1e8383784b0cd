use crate::store::{CacheStore, StringUpdate};
use async_trait::async_trait;
use common::UserId;
use common::errors::AppError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;

/// 进程内缓存实现，语义对齐 Redis（空 set 自动删除 key）
#[derive(Debug, Default)]
pub struct LocalCacheStore {
    sets: DashMap<String, HashSet<String>>,
    strings: DashMap<String, String>,
}

impl LocalCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入原始成员值（可写入非数字值，模拟脏数据）
    pub fn insert_raw_member(&self, key: &str, raw: &str) {
        self.sets.entry(key.to_string()).or_default().insert(raw.to_string());
    }
}

#[async_trait]
impl CacheStore for LocalCacheStore {
    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.sets.contains_key(key) || self.strings.contains_key(key))
    }

    async fn set_add(&self, key: &str, members: &[UserId]) -> Result<u64, AppError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut set = self.sets.entry(key.to_string()).or_default();
        let added = members.iter().filter(|m| set.insert(m.to_string())).count();
        Ok(added as u64)
    }

    async fn set_replace(&self, key: &str, members: &[UserId]) -> Result<(), AppError> {
        if members.is_empty() {
            self.sets.remove(key);
            return Ok(());
        }
        let fresh: HashSet<String> = members.iter().map(|m| m.to_string()).collect();
        self.sets.insert(key.to_string(), fresh);
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[UserId]) -> Result<(u64, u64), AppError> {
        let (removed, remain) = match self.sets.get_mut(key) {
            Some(mut set) => {
                let removed = members.iter().filter(|m| set.remove(&m.to_string())).count();
                (removed as u64, set.len() as u64)
            }
            None => return Ok((0, 0)),
        };
        if remain == 0 {
            // 释放锁后可能已有并发 add 写入，只删仍为空的
            self.sets.remove_if(key, |_, set| set.is_empty());
        }
        Ok((removed, remain))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, AppError> {
        Ok(self.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    async fn set_contains(&self, key: &str, member: UserId) -> Result<bool, AppError> {
        Ok(self.sets.get(key).is_some_and(|s| s.contains(&member.to_string())))
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.strings.get(key).map(|v| v.clone()))
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn update_string(&self, key: &str, update: &StringUpdate<'_>) -> Result<(), AppError> {
        // entry 持有分片写锁，读-改-写整体互斥
        match self.strings.entry(key.to_string()) {
            Entry::Occupied(mut e) => match update(Some(e.get().as_str())) {
                Some(v) => {
                    e.insert(v);
                }
                None => {
                    e.remove();
                }
            },
            Entry::Vacant(e) => {
                if let Some(v) = update(None) {
                    e.insert(v);
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        let a = self.sets.remove(key).is_some();
        let b = self.strings.remove(key).is_some();
        Ok(a || b)
    }
}
