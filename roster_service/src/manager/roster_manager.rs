use crate::entitys::channel_meta::{ChannelMeta, VersionUpdate};
use crate::entitys::participant::ParticipantRecord;
use crate::manager::bulk_deleter::BulkDeleter;
use crate::manager::bulk_processor::{BulkItemFailure, BulkProcessor, BulkReport};
use crate::manager::cache_mirror::CacheMirror;
use crate::manager::query_paginator::{QueryPage, QueryPaginator, Window};
use crate::manager::version_manager::VersionManager;
use crate::shard_router::ShardRouter;
use crate::store::mongo_store::MongoDocumentStore;
use crate::store::redis_cache::RedisCacheStore;
use crate::store::{BulkMode, BulkOperation, CacheStore, DocumentStore, RosterFilter, ShardTarget};
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::config::RosterConfig;
use common::errors::AppError;
use common::{ChannelId, RedisPool, UserId};
use log::{info, warn};
use mongodb::bson;
use mongodb::{Client, Database};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// 一次同步调用的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub channel_id: ChannelId,
    /// 成功写入的成员数
    pub written: u64,
    pub failed: Vec<BulkItemFailure>,
    pub deleted: u64,
    /// 版本处理结果，Skip 时为 None
    pub meta: Option<ChannelMeta>,
    /// 本次同步到缓存的成员数
    pub cached: usize,
}

/// 频道成员名册同步接口
///
/// 每个写操作的步骤顺序固定：写文档库 → 刷新 → 更新版本 → 同步缓存；
/// 任一步骤出错即返回，不回滚已完成的步骤。
#[async_trait]
pub trait RosterManagerOpt: Send + Sync {
    /// 全量重载：清空频道成员后整体写入，缓存整体替换
    async fn full_reload(&self, channel_id: ChannelId, version: VersionUpdate, records: Vec<ParticipantRecord>) -> Result<SyncReport>;

    /// 全量重载（流式输入），发送端关闭即视为输入结束
    async fn full_reload_stream(
        &self,
        channel_id: ChannelId,
        version: VersionUpdate,
        records: mpsc::Receiver<ParticipantRecord>,
    ) -> Result<SyncReport>;

    /// 增量 upsert，新成员追加到缓存
    async fn incremental_upsert(&self, channel_id: ChannelId, version: VersionUpdate, records: Vec<ParticipantRecord>) -> Result<SyncReport>;

    /// 按 user_id 删除成员并从缓存移除
    async fn delete_users(&self, channel_id: ChannelId, version: VersionUpdate, user_ids: Vec<UserId>) -> Result<SyncReport>;

    /// 单独处理版本；Skip 返回当前版本
    async fn bump_version(&self, channel_id: ChannelId, version: VersionUpdate) -> Result<ChannelMeta>;

    async fn get_version(&self, channel_id: ChannelId) -> Result<ChannelMeta>;

    /// 活跃的创建者 / 管理员，按 user_id 倒序
    async fn query_admins(&self, channel_id: ChannelId, window: Window) -> Result<QueryPage>;

    /// 频道全部成员，按 user_id 倒序
    async fn query_participants(&self, channel_id: ChannelId, window: Window) -> Result<QueryPage>;

    /// 缓存 set 视图，未缓存返回 None
    async fn cached_members(&self, channel_id: ChannelId) -> Result<Option<Vec<UserId>>>;

    /// 缓存字符串视图，未缓存返回 None
    async fn cached_members_string(&self, channel_id: ChannelId) -> Result<Option<Vec<UserId>>>;

    async fn is_cached_member(&self, channel_id: ChannelId, user_id: UserId) -> Result<bool>;
}

#[derive(Clone)]
pub struct RosterManager {
    store: Arc<dyn DocumentStore>,
    router: ShardRouter,
    cfg: RosterConfig,
    versions: VersionManager,
    deleter: BulkDeleter,
    paginator: QueryPaginator,
    cache: CacheMirror,
}

impl RosterManager {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<dyn CacheStore>, cfg: RosterConfig) -> Result<Self, AppError> {
        let router = ShardRouter::new(cfg.shard_count)?;
        Ok(Self {
            versions: VersionManager::new(store.clone(), router, &cfg),
            deleter: BulkDeleter::new(store.clone(), router, cfg.delete_chunk_size),
            paginator: QueryPaginator::new(store.clone(), router, &cfg),
            cache: CacheMirror::new(cache),
            store,
            router,
            cfg,
        })
    }

    /// MongoDB + Redis 组合
    pub fn with_mongo_redis(client: Client, db: Database, pool: RedisPool, cfg: RosterConfig) -> Result<Self, AppError> {
        let store = Arc::new(MongoDocumentStore::new(client, db));
        let cache = Arc::new(RedisCacheStore::new(pool));
        Self::new(store, cache, cfg)
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    fn check_records(channel_id: ChannelId, records: &[ParticipantRecord]) -> Result<(), AppError> {
        match records.iter().find(|r| r.channel_id != channel_id) {
            Some(r) => Err(mismatch(channel_id, r)),
            None => Ok(()),
        }
    }

    /// 写入并返回 (报告, 成功写入的 user_id，按输入顺序去重)
    async fn write_records<I>(&self, target: &ShardTarget, mode: BulkMode, records: I) -> Result<(BulkReport, Vec<UserId>), AppError>
    where
        I: IntoIterator<Item = ParticipantRecord>,
    {
        let processor = BulkProcessor::start(self.store.clone(), target.clone(), mode, &self.cfg.bulk);
        let mut ids = Vec::new();
        for rec in records {
            let op = to_operation(&rec)?;
            ids.push(rec.user_id);
            processor.add(op).await?;
        }
        let report = processor.close().await?;
        let ids = written_ids(ids, &report);
        Ok((report, ids))
    }

    async fn finish_write(&self, target: &ShardTarget, version: VersionUpdate) -> Result<Option<ChannelMeta>, AppError> {
        self.store.refresh(target).await?;
        self.versions.apply(target.channel_id, version).await
    }
}

fn mismatch(channel_id: ChannelId, rec: &ParticipantRecord) -> AppError {
    AppError::Precondition(format!("record for user {} belongs to channel {}, not {}", rec.user_id, rec.channel_id, channel_id))
}

fn to_operation(rec: &ParticipantRecord) -> Result<BulkOperation, AppError> {
    let body = bson::to_document(rec)?;
    Ok(BulkOperation::new(ShardRouter::participant_key(rec.channel_id, rec.user_id), rec.user_id, body))
}

/// 至少有一条写入成功的 id，保持输入顺序并去重
///
/// 同一用户可能出现多次，只有全部副本都失败才算未写入
fn written_ids(ids: Vec<UserId>, report: &BulkReport) -> Vec<UserId> {
    let mut sent: HashMap<UserId, usize> = HashMap::with_capacity(ids.len());
    for id in &ids {
        *sent.entry(*id).or_default() += 1;
    }
    let mut failed: HashMap<UserId, usize> = HashMap::new();
    for id in report.failed_user_ids() {
        *failed.entry(id).or_default() += 1;
    }
    let mut seen = HashSet::with_capacity(sent.len());
    ids.into_iter()
        .filter(|id| failed.get(id).copied().unwrap_or(0) < sent.get(id).copied().unwrap_or(0) && seen.insert(*id))
        .collect()
}

#[async_trait]
impl RosterManagerOpt for RosterManager {
    async fn full_reload(&self, channel_id: ChannelId, version: VersionUpdate, records: Vec<ParticipantRecord>) -> Result<SyncReport> {
        let ctx = || format!("full_reload channel {}", channel_id);
        let start = Instant::now();
        let target = self.router.target(channel_id).with_context(ctx)?;
        Self::check_records(channel_id, &records).with_context(ctx)?;
        self.store.ensure_container(&target).await.with_context(ctx)?;

        let purged = self.deleter.delete_all(channel_id).await.with_context(ctx)?;
        let (bulk, ids) = self.write_records(&target, BulkMode::Index, records).await.with_context(ctx)?;
        let meta = self.finish_write(&target, version).await.with_context(ctx)?;
        self.cache.mirror_reset(channel_id, &ids).await.with_context(ctx)?;

        info!(
            "✅ full reload channel {}: purged {}, wrote {} ({} failed) in {} batches, {:?}",
            channel_id,
            purged.deleted,
            bulk.succeeded,
            bulk.failed.len(),
            bulk.batches,
            start.elapsed()
        );
        Ok(SyncReport { channel_id, written: bulk.succeeded, failed: bulk.failed, deleted: purged.deleted, meta, cached: ids.len() })
    }

    async fn full_reload_stream(
        &self,
        channel_id: ChannelId,
        version: VersionUpdate,
        mut records: mpsc::Receiver<ParticipantRecord>,
    ) -> Result<SyncReport> {
        let ctx = || format!("full_reload_stream channel {}", channel_id);
        let start = Instant::now();
        let target = self.router.target(channel_id).with_context(ctx)?;
        self.store.ensure_container(&target).await.with_context(ctx)?;
        let purged = self.deleter.delete_all(channel_id).await.with_context(ctx)?;

        let processor = BulkProcessor::start(self.store.clone(), target.clone(), BulkMode::Index, &self.cfg.bulk);
        let mut ids = Vec::new();
        while let Some(rec) = records.recv().await {
            if rec.channel_id != channel_id {
                // 已入队的照常写完，但不再推进版本和缓存
                let partial = processor.close().await.with_context(ctx)?;
                warn!("channel {} stream aborted after {} writes", channel_id, partial.succeeded);
                return Err(mismatch(channel_id, &rec)).with_context(ctx);
            }
            let op = to_operation(&rec).with_context(ctx)?;
            ids.push(rec.user_id);
            processor.add(op).await.with_context(ctx)?;
        }
        let bulk = processor.close().await.with_context(ctx)?;
        let ids = written_ids(ids, &bulk);
        let meta = self.finish_write(&target, version).await.with_context(ctx)?;
        self.cache.mirror_reset(channel_id, &ids).await.with_context(ctx)?;

        info!("✅ stream reload channel {}: wrote {} ({} failed), {:?}", channel_id, bulk.succeeded, bulk.failed.len(), start.elapsed());
        Ok(SyncReport { channel_id, written: bulk.succeeded, failed: bulk.failed, deleted: purged.deleted, meta, cached: ids.len() })
    }

    async fn incremental_upsert(&self, channel_id: ChannelId, version: VersionUpdate, records: Vec<ParticipantRecord>) -> Result<SyncReport> {
        let ctx = || format!("incremental_upsert channel {}", channel_id);
        let start = Instant::now();
        let target = self.router.target(channel_id).with_context(ctx)?;
        Self::check_records(channel_id, &records).with_context(ctx)?;
        self.store.ensure_container(&target).await.with_context(ctx)?;

        let (bulk, ids) = self.write_records(&target, BulkMode::Upsert, records).await.with_context(ctx)?;
        let meta = self.finish_write(&target, version).await.with_context(ctx)?;
        self.cache.mirror_add(channel_id, &ids).await.with_context(ctx)?;

        info!("✅ upsert channel {}: wrote {} ({} failed), {:?}", channel_id, bulk.succeeded, bulk.failed.len(), start.elapsed());
        Ok(SyncReport { channel_id, written: bulk.succeeded, failed: bulk.failed, deleted: 0, meta, cached: ids.len() })
    }

    async fn delete_users(&self, channel_id: ChannelId, version: VersionUpdate, user_ids: Vec<UserId>) -> Result<SyncReport> {
        let ctx = || format!("delete_users channel {}", channel_id);
        let start = Instant::now();
        let target = self.router.target(channel_id).with_context(ctx)?;
        if user_ids.is_empty() {
            // 没有要删的，不推进版本也不动缓存
            return Ok(SyncReport { channel_id, ..Default::default() });
        }
        let removed = self.deleter.delete_users(channel_id, &user_ids).await.with_context(ctx)?;
        let meta = self.finish_write(&target, version).await.with_context(ctx)?;
        let (uncached, remaining) = self.cache.mirror_remove(channel_id, &user_ids).await.with_context(ctx)?;

        info!(
            "✅ delete channel {}: {} docs, {} cache entries, {} left in cache, {:?}",
            channel_id,
            removed.deleted,
            uncached,
            remaining,
            start.elapsed()
        );
        Ok(SyncReport { channel_id, deleted: removed.deleted, meta, cached: uncached as usize, ..Default::default() })
    }

    async fn bump_version(&self, channel_id: ChannelId, version: VersionUpdate) -> Result<ChannelMeta> {
        let ctx = || format!("bump_version channel {}", channel_id);
        match self.versions.apply(channel_id, version).await.with_context(ctx)? {
            Some(meta) => Ok(meta),
            None => self.versions.get(channel_id).await.with_context(ctx),
        }
    }

    async fn get_version(&self, channel_id: ChannelId) -> Result<ChannelMeta> {
        self.versions.get(channel_id).await.with_context(|| format!("get_version channel {}", channel_id))
    }

    async fn query_admins(&self, channel_id: ChannelId, window: Window) -> Result<QueryPage> {
        let start = Instant::now();
        let page = self
            .paginator
            .query(channel_id, &RosterFilter::elevated(channel_id), window)
            .await
            .with_context(|| format!("query_admins channel {}", channel_id))?;
        info!("query admins channel {}: {} of {} in {:?}", channel_id, page.items.len(), page.total, start.elapsed());
        Ok(page)
    }

    async fn query_participants(&self, channel_id: ChannelId, window: Window) -> Result<QueryPage> {
        self.paginator
            .query(channel_id, &RosterFilter::channel(channel_id), window)
            .await
            .with_context(|| format!("query_participants channel {}", channel_id))
    }

    async fn cached_members(&self, channel_id: ChannelId) -> Result<Option<Vec<UserId>>> {
        let ctx = || format!("cached_members channel {}", channel_id);
        if !self.cache.exists(channel_id).await.with_context(ctx)? {
            return Ok(None);
        }
        Ok(Some(self.cache.members(channel_id).await.with_context(ctx)?))
    }

    async fn cached_members_string(&self, channel_id: ChannelId) -> Result<Option<Vec<UserId>>> {
        self.cache.members_from_string(channel_id).await.with_context(|| format!("cached_members_string channel {}", channel_id))
    }

    async fn is_cached_member(&self, channel_id: ChannelId, user_id: UserId) -> Result<bool> {
        self.cache.contains(channel_id, user_id).await.with_context(|| format!("is_cached_member channel {}", channel_id))
    }
}
