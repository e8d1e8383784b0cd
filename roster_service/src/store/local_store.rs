use crate::entitys::channel_meta::{ChannelMeta, MetaUpdate};
use crate::store::{
    BulkItemResult, BulkMode, BulkOperation, DeleteByFilterResult, DocumentStore, OrderType, RosterFilter, ScanCursor, SearchPage,
    ShardTarget, doc_i64,
};
use async_trait::async_trait;
use common::errors::AppError;
use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use mongodb::bson::{self, Document};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Container = DashMap<String, Document>;

/// 进程内文档存储：分片容器 -> (文档 ID -> 原始文档)
///
/// 与 MongoDB 实现共享 `RosterFilter` 语义，用于单机运行和测试
#[derive(Debug, Default)]
pub struct LocalDocumentStore {
    containers: DashMap<String, Container>,
    /// 尚未 clear 的游标数
    open_scans: Arc<AtomicUsize>,
}

impl LocalDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn container(&self, name: &str) -> Ref<'_, String, Container> {
        if let Some(c) = self.containers.get(name) {
            return c;
        }
        self.containers.entry(name.to_string()).or_default().downgrade()
    }

    pub fn open_scan_count(&self) -> usize {
        self.open_scans.load(Ordering::SeqCst)
    }

    /// 容器内文档总数（含 meta）
    pub fn doc_count(&self, target: &ShardTarget) -> usize {
        self.containers.get(&target.container).map(|c| c.len()).unwrap_or(0)
    }

    /// 直接写入原始文档（可写入字段类型错误的文档，模拟脏数据）
    pub fn insert_raw(&self, target: &ShardTarget, doc_id: &str, doc: Document) {
        self.container(&target.container).insert(doc_id.to_string(), doc);
    }

    /// 过滤 + 按 user_id 排序后的快照
    fn matching(&self, target: &ShardTarget, filter: &RosterFilter, order: OrderType) -> Vec<Document> {
        let container = self.container(&target.container);
        let mut hits: Vec<Document> = container
            .iter()
            .filter(|e| filter.matches(e.key(), e.value()))
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|d| doc_i64(d, "user_id").unwrap_or(i64::MIN));
        if order == OrderType::Desc {
            hits.reverse();
        }
        hits
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn ensure_container(&self, target: &ShardTarget) -> Result<(), AppError> {
        self.container(&target.container);
        Ok(())
    }

    async fn bulk(&self, target: &ShardTarget, mode: BulkMode, ops: &[BulkOperation]) -> Result<Vec<BulkItemResult>, AppError> {
        let container = self.container(&target.container);
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            match mode {
                BulkMode::Index => {
                    container.insert(op.doc_id.clone(), op.body.clone());
                }
                BulkMode::Upsert => {
                    let mut existing = container.entry(op.doc_id.clone()).or_default();
                    for (k, v) in op.body.iter() {
                        existing.insert(k.clone(), v.clone());
                    }
                }
            }
            results.push(BulkItemResult { doc_id: op.doc_id.clone(), user_id: op.user_id, error: None });
        }
        Ok(results)
    }

    async fn delete_by_filter(&self, target: &ShardTarget, filter: &RosterFilter) -> Result<DeleteByFilterResult, AppError> {
        let container = self.container(&target.container);
        let before = container.len();
        container.retain(|id, doc| !filter.matches(id, doc));
        let deleted = (before - container.len()) as u64;
        Ok(DeleteByFilterResult { deleted, failures: Vec::new() })
    }

    async fn get_meta(&self, target: &ShardTarget) -> Result<Option<ChannelMeta>, AppError> {
        let container = self.container(&target.container);
        match container.get(&target.meta_key()) {
            Some(d) => Ok(Some(bson::from_document(d.value().clone())?)),
            None => Ok(None),
        }
    }

    async fn apply_meta(&self, target: &ShardTarget, update: MetaUpdate) -> Result<ChannelMeta, AppError> {
        let container = self.container(&target.container);
        // entry 持有分片写锁，读改写在锁内完成
        let mut entry = container.entry(target.meta_key()).or_default();
        let current = doc_i64(entry.value(), "version");
        let meta = match update {
            MetaUpdate::Increment { updated_at } => ChannelMeta {
                channel_id: target.channel_id,
                version: current.map(|v| v + 1).unwrap_or(1),
                updated_at,
            },
            MetaUpdate::Set { version, updated_at } => ChannelMeta { channel_id: target.channel_id, version, updated_at },
        };
        *entry.value_mut() = bson::to_document(&meta)?;
        Ok(meta)
    }

    async fn search(&self, target: &ShardTarget, filter: &RosterFilter, order: OrderType, from: u64, size: u64) -> Result<SearchPage, AppError> {
        let all = self.matching(target, filter, order);
        let total = all.len() as u64;
        let hits = all.into_iter().skip(from as usize).take(size as usize).collect();
        Ok(SearchPage { hits, total })
    }

    async fn count(&self, target: &ShardTarget, filter: &RosterFilter) -> Result<u64, AppError> {
        let container = self.container(&target.container);
        Ok(container.iter().filter(|e| filter.matches(e.key(), e.value())).count() as u64)
    }

    async fn open_scan(
        &self,
        target: &ShardTarget,
        filter: &RosterFilter,
        order: OrderType,
        batch_size: u32,
        _keep_alive: Duration,
    ) -> Result<Box<dyn ScanCursor>, AppError> {
        // 打开时取快照，和滚动游标的时间点一致性相同
        let snapshot: VecDeque<Document> = self.matching(target, filter, order).into();
        self.open_scans.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalScanCursor {
            remaining: snapshot,
            batch_size: batch_size.max(1) as usize,
            open_scans: self.open_scans.clone(),
            cleared: false,
        }))
    }

    async fn refresh(&self, _target: &ShardTarget) -> Result<(), AppError> {
        Ok(())
    }
}

pub struct LocalScanCursor {
    remaining: VecDeque<Document>,
    batch_size: usize,
    open_scans: Arc<AtomicUsize>,
    cleared: bool,
}

#[async_trait]
impl ScanCursor for LocalScanCursor {
    async fn next_batch(&mut self) -> Result<Option<Vec<Document>>, AppError> {
        if self.cleared {
            return Err(AppError::Precondition("scan cursor already cleared".to_string()));
        }
        if self.remaining.is_empty() {
            return Ok(None);
        }
        let n = self.batch_size.min(self.remaining.len());
        Ok(Some(self.remaining.drain(..n).collect()))
    }

    async fn clear(&mut self) -> Result<(), AppError> {
        if !self.cleared {
            self.cleared = true;
            self.remaining.clear();
            self.open_scans.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
