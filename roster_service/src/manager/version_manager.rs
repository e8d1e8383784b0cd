use crate::entitys::channel_meta::{ChannelMeta, MetaUpdate, VersionUpdate};
use crate::shard_router::ShardRouter;
use crate::store::DocumentStore;
use common::ChannelId;
use common::config::RosterConfig;
use common::errors::AppError;
use common::util::date_util::now;
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// 频道版本号管理（meta 文档读写）
#[derive(Clone)]
pub struct VersionManager {
    store: Arc<dyn DocumentStore>,
    router: ShardRouter,
    /// 冲突时最多尝试次数（含第一次）
    max_attempts: u32,
    timeout: Duration,
}

impl VersionManager {
    pub fn new(store: Arc<dyn DocumentStore>, router: ShardRouter, cfg: &RosterConfig) -> Self {
        Self {
            store,
            router,
            max_attempts: cfg.meta_retry_on_conflict.max(1),
            timeout: Duration::from_millis(cfg.meta_timeout_ms),
        }
    }

    async fn timed<T, F>(&self, what: &str, channel_id: ChannelId, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| AppError::Timeout(format!("{} channel {} exceeded {:?}", what, channel_id, self.timeout)))?
    }

    /// 读取版本，meta 不存在时返回零版本
    pub async fn get(&self, channel_id: ChannelId) -> Result<ChannelMeta, AppError> {
        let target = self.router.target(channel_id)?;
        let meta = self.timed("get meta", channel_id, self.store.get_meta(&target)).await?;
        Ok(meta.unwrap_or_else(|| ChannelMeta::empty(channel_id)))
    }

    /// 显式设置版本（整条覆盖）
    pub async fn set(&self, channel_id: ChannelId, version: i64) -> Result<ChannelMeta, AppError> {
        if version <= 0 {
            return Err(AppError::Precondition(format!("explicit version must be positive, got {}", version)));
        }
        let target = self.router.target(channel_id)?;
        let update = MetaUpdate::Set { version, updated_at: now() };
        let meta = self.timed("set meta", channel_id, self.store.apply_meta(&target, update)).await?;
        debug!("channel {} version set to {}", channel_id, meta.version);
        Ok(meta)
    }

    /// 原子自增，不存在则初始化为 1；并发 upsert 冲突时重试
    pub async fn increment_or_init(&self, channel_id: ChannelId) -> Result<ChannelMeta, AppError> {
        let target = self.router.target(channel_id)?;
        let mut attempt = 1;
        loop {
            let update = MetaUpdate::Increment { updated_at: now() };
            match self.timed("increment meta", channel_id, self.store.apply_meta(&target, update)).await {
                Ok(meta) => return Ok(meta),
                Err(e) if e.is_conflict() && attempt < self.max_attempts => {
                    warn!("channel {} meta increment conflict (attempt {}/{}): {}", channel_id, attempt, self.max_attempts, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 按写操作附带的版本策略处理；Skip 返回 None
    pub async fn apply(&self, channel_id: ChannelId, update: VersionUpdate) -> Result<Option<ChannelMeta>, AppError> {
        match update {
            VersionUpdate::Skip => Ok(None),
            VersionUpdate::Auto => self.increment_or_init(channel_id).await.map(Some),
            VersionUpdate::Exact(v) => self.set(channel_id, v).await.map(Some),
        }
    }
}
