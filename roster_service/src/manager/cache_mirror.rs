use crate::shard_router::ShardRouter;
use crate::store::CacheStore;
use common::errors::AppError;
use common::{ChannelId, UserId};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// 成员缓存镜像：set 视图（判断成员关系）+ 逗号分隔字符串视图（一次取全量）
#[derive(Clone)]
pub struct CacheMirror {
    cache: Arc<dyn CacheStore>,
}

impl CacheMirror {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    // ==== set 视图 ====

    /// 整体替换，空列表等于删除
    pub async fn reset(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<(), AppError> {
        self.cache.set_replace(&ShardRouter::cache_set_key(channel_id), user_ids).await
    }

    pub async fn add(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<u64, AppError> {
        if user_ids.is_empty() {
            return Ok(0);
        }
        self.cache.set_add(&ShardRouter::cache_set_key(channel_id), user_ids).await
    }

    /// 返回 (移除数, 剩余数)
    pub async fn remove(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<(u64, u64), AppError> {
        let key = ShardRouter::cache_set_key(channel_id);
        if user_ids.is_empty() {
            let remain = self.cache.set_members(&key).await?.len() as u64;
            return Ok((0, remain));
        }
        self.cache.set_remove(&key, user_ids).await
    }

    pub async fn exists(&self, channel_id: ChannelId) -> Result<bool, AppError> {
        self.cache.exists(&ShardRouter::cache_set_key(channel_id)).await
    }

    pub async fn members(&self, channel_id: ChannelId) -> Result<Vec<UserId>, AppError> {
        let key = ShardRouter::cache_set_key(channel_id);
        let raw = self.cache.set_members(&key).await?;
        Ok(parse_ids(&key, raw.iter().map(String::as_str)))
    }

    pub async fn contains(&self, channel_id: ChannelId, user_id: UserId) -> Result<bool, AppError> {
        self.cache.set_contains(&ShardRouter::cache_set_key(channel_id), user_id).await
    }

    // ==== 字符串视图 ====

    /// 覆盖写，去重并保持输入顺序
    pub async fn reset_string(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<(), AppError> {
        let mut seen = HashSet::with_capacity(user_ids.len());
        let ids: Vec<UserId> = user_ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        self.cache.set_string(&ShardRouter::cache_string_key(channel_id), &join_ids(&ids)).await
    }

    /// 原子地读-合并-写：保留原有顺序，新 id 追加在后
    pub async fn add_string(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<(), AppError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let key = ShardRouter::cache_string_key(channel_id);
        let append = |current: Option<&str>| {
            let mut ids = current.map(|raw| split_ids(&key, raw)).unwrap_or_default();
            let mut seen: HashSet<UserId> = ids.iter().copied().collect();
            ids.extend(user_ids.iter().copied().filter(|id| seen.insert(*id)));
            Some(join_ids(&ids))
        };
        self.cache.update_string(&key, &append).await
    }

    /// 原子地读-过滤-写，剩余为空时删除 key
    pub async fn remove_string(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<(), AppError> {
        let key = ShardRouter::cache_string_key(channel_id);
        let removing: HashSet<UserId> = user_ids.iter().copied().collect();
        let retain = |current: Option<&str>| {
            let kept: Vec<UserId> = split_ids(&key, current?).into_iter().filter(|id| !removing.contains(id)).collect();
            (!kept.is_empty()).then(|| join_ids(&kept))
        };
        self.cache.update_string(&key, &retain).await
    }

    /// key 不存在返回 None
    pub async fn members_from_string(&self, channel_id: ChannelId) -> Result<Option<Vec<UserId>>, AppError> {
        self.read_string(&ShardRouter::cache_string_key(channel_id)).await
    }

    async fn read_string(&self, key: &str) -> Result<Option<Vec<UserId>>, AppError> {
        let raw = self.cache.get_string(key).await?;
        Ok(raw.map(|s| split_ids(key, &s)))
    }

    // ==== 两个视图同时更新 ====

    pub async fn mirror_reset(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<(), AppError> {
        self.reset(channel_id, user_ids).await?;
        self.reset_string(channel_id, user_ids).await?;
        debug!("channel {} cache reset with {} members", channel_id, user_ids.len());
        Ok(())
    }

    pub async fn mirror_add(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<u64, AppError> {
        let added = self.add(channel_id, user_ids).await?;
        self.add_string(channel_id, user_ids).await?;
        Ok(added)
    }

    pub async fn mirror_remove(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<(u64, u64), AppError> {
        let out = self.remove(channel_id, user_ids).await?;
        self.remove_string(channel_id, user_ids).await?;
        Ok(out)
    }
}

fn join_ids(ids: &[UserId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn split_ids(key: &str, raw: &str) -> Vec<UserId> {
    parse_ids(key, raw.split(',').filter(|p| !p.is_empty()))
}

fn parse_ids<'a>(key: &str, raw: impl Iterator<Item = &'a str>) -> Vec<UserId> {
    raw.filter_map(|s| match s.trim().parse::<UserId>() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("⚠️ skip unparseable member {:?} in {}", s, key);
            None
        }
    })
    .collect()
}
