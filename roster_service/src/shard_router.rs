use crate::store::ShardTarget;
use common::errors::AppError;
use common::{ChannelId, UserId};

/// 分片容器名前缀
pub const SHARD_PREFIX: &str = "channel_participants";

/// 频道 -> 分片 / 文档 key 的纯函数映射，无状态、无随机、无时间因素
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    shard_count: i64,
}

impl ShardRouter {
    pub fn new(shard_count: i64) -> Result<Self, AppError> {
        if shard_count <= 0 {
            return Err(AppError::Precondition(format!("shard_count must be positive, got {}", shard_count)));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> i64 {
        self.shard_count
    }

    /// `channel_id % N` 格式化为容器名；channel_id <= 0 返回 None
    pub fn shard_index(&self, channel_id: ChannelId) -> Option<String> {
        if channel_id <= 0 {
            return None;
        }
        Some(format!("{}_{:03}", SHARD_PREFIX, channel_id % self.shard_count))
    }

    /// 同 `shard_index`，但非法频道直接返回前置条件错误
    pub fn require_shard(&self, channel_id: ChannelId) -> Result<String, AppError> {
        self.shard_index(channel_id)
            .ok_or_else(|| AppError::Precondition(format!("invalid channel_id {}: empty shard", channel_id)))
    }

    /// 解析出单频道请求的分片目标
    pub fn target(&self, channel_id: ChannelId) -> Result<ShardTarget, AppError> {
        Ok(ShardTarget { container: self.require_shard(channel_id)?, channel_id })
    }

    /// 路由 key：同一频道的所有请求落到同一分区
    pub fn routing_key(channel_id: ChannelId) -> String {
        channel_id.to_string()
    }

    pub fn participant_key(channel_id: ChannelId, user_id: UserId) -> String {
        format!("channel:{}:{}", channel_id, user_id)
    }

    pub fn meta_key(channel_id: ChannelId) -> String {
        format!("channel:{}:meta", channel_id)
    }

    /// 缓存 set 视图 key
    pub fn cache_set_key(channel_id: ChannelId) -> String {
        format!("channel:{}:participants", channel_id)
    }

    /// 缓存字符串视图 key
    pub fn cache_string_key(channel_id: ChannelId) -> String {
        format!("channel:{}:participants:str", channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn shard_is_modulo() {
        let router = ShardRouter::new(1000).unwrap();
        assert_eq!(router.shard_index(1001).as_deref(), Some("channel_participants_001"));
        assert_eq!(router.shard_index(42).as_deref(), Some("channel_participants_042"));
        assert_eq!(router.shard_index(1000).as_deref(), Some("channel_participants_000"));
    }

    #[test]
    fn non_positive_channel_has_no_shard() {
        let router = ShardRouter::new(16).unwrap();
        assert!(router.shard_index(0).is_none());
        assert!(router.shard_index(-5).is_none());
        assert!(matches!(router.require_shard(0), Err(AppError::Precondition(_))));
        assert!(router.target(-1).is_err());
        assert_eq!(router.target(35).unwrap().container, "channel_participants_003");
    }

    #[test]
    fn zero_shards_rejected() {
        assert!(ShardRouter::new(0).is_err());
    }

    #[test]
    fn keys_are_injective() {
        let mut seen = HashSet::new();
        for c in [1, 12, 121] {
            for u in [1, 21, 211] {
                assert!(seen.insert(ShardRouter::participant_key(c, u)));
            }
        }
        assert_eq!(ShardRouter::participant_key(1001, 7), "channel:1001:7");
        assert_eq!(ShardRouter::meta_key(1001), "channel:1001:meta");
        assert!(!seen.contains(&ShardRouter::meta_key(1)));
    }
}
