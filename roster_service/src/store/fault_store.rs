//! 测试用：在本地存储外面包一层可注入故障的实现

use crate::entitys::channel_meta::{ChannelMeta, MetaUpdate};
use crate::store::local_store::LocalDocumentStore;
use crate::store::{
    BulkItemResult, BulkMode, BulkOperation, DeleteByFilterResult, DeleteFailure, DeleteFailureKind, DocumentStore, OrderType,
    RosterFilter, ScanCursor, SearchPage, ShardTarget,
};
use async_trait::async_trait;
use common::UserId;
use common::errors::AppError;
use dashmap::DashSet;
use mongodb::bson::Document;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct FaultStore {
    pub inner: LocalDocumentStore,
    /// 前 N 次 bulk 请求整体返回临时错误
    pub bulk_transient: AtomicU32,
    /// 这些用户的写入逐条失败（不落库）
    pub bulk_reject: DashSet<UserId>,
    /// 只让每个用户的第一条写入失败一次
    pub bulk_reject_once: DashSet<UserId>,
    pub bulk_calls: AtomicUsize,
    /// 测试持有写锁期间 bulk 请求挂起
    pub bulk_gate: RwLock<()>,
    /// 前 N 次 meta 更新返回冲突
    pub meta_conflicts: AtomicU32,
    pub meta_delay: Mutex<Option<Duration>>,
    /// 包含该用户的删除块附带一条指定类型的失败
    pub delete_fault: Mutex<Option<(UserId, DeleteFailureKind)>>,
    /// 扫描第 N 批时报错
    pub scan_fail_at: Mutex<Option<usize>>,
}

impl FaultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for FaultStore {
    async fn ensure_container(&self, target: &ShardTarget) -> Result<(), AppError> {
        self.inner.ensure_container(target).await
    }

    async fn bulk(&self, target: &ShardTarget, mode: BulkMode, ops: &[BulkOperation]) -> Result<Vec<BulkItemResult>, AppError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let _open = self.bulk_gate.read().await;
        let pending = self.bulk_transient.load(Ordering::SeqCst);
        if pending > 0 {
            self.bulk_transient.store(pending - 1, Ordering::SeqCst);
            return Err(AppError::Transient("es_rejected_execution".to_string()));
        }
        let (rejected, accepted): (Vec<&BulkOperation>, Vec<&BulkOperation>) =
            ops.iter().partition(|op| self.bulk_reject.contains(&op.user_id) || self.bulk_reject_once.remove(&op.user_id).is_some());
        let accepted: Vec<BulkOperation> = accepted.into_iter().cloned().collect();
        let mut out = self.inner.bulk(target, mode, &accepted).await?;
        out.extend(rejected.into_iter().map(|op| BulkItemResult {
            doc_id: op.doc_id.clone(),
            user_id: op.user_id,
            error: Some("mapper_parsing_exception".to_string()),
        }));
        Ok(out)
    }

    async fn delete_by_filter(&self, target: &ShardTarget, filter: &RosterFilter) -> Result<DeleteByFilterResult, AppError> {
        let mut out = self.inner.delete_by_filter(target, filter).await?;
        let fault = *self.delete_fault.lock().unwrap();
        if let (Some((uid, kind)), Some(ids)) = (fault, filter.user_ids.as_ref()) {
            if ids.contains(&uid) {
                out.failures.push(DeleteFailure { doc_id: Some(format!("channel:{}:{}", filter.channel_id, uid)), kind, reason: format!("{:?}", kind) });
            }
        }
        Ok(out)
    }

    async fn get_meta(&self, target: &ShardTarget) -> Result<Option<ChannelMeta>, AppError> {
        self.inner.get_meta(target).await
    }

    async fn apply_meta(&self, target: &ShardTarget, update: MetaUpdate) -> Result<ChannelMeta, AppError> {
        let delay = *self.meta_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let pending = self.meta_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.meta_conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(AppError::Conflict("version_conflict_engine_exception".to_string()));
        }
        self.inner.apply_meta(target, update).await
    }

    async fn search(&self, target: &ShardTarget, filter: &RosterFilter, order: OrderType, from: u64, size: u64) -> Result<SearchPage, AppError> {
        self.inner.search(target, filter, order, from, size).await
    }

    async fn count(&self, target: &ShardTarget, filter: &RosterFilter) -> Result<u64, AppError> {
        self.inner.count(target, filter).await
    }

    async fn open_scan(
        &self,
        target: &ShardTarget,
        filter: &RosterFilter,
        order: OrderType,
        batch_size: u32,
        keep_alive: Duration,
    ) -> Result<Box<dyn ScanCursor>, AppError> {
        let inner = self.inner.open_scan(target, filter, order, batch_size, keep_alive).await?;
        let fail_at = *self.scan_fail_at.lock().unwrap();
        Ok(Box::new(FaultCursor { inner, fail_at, served: 0 }))
    }

    async fn refresh(&self, target: &ShardTarget) -> Result<(), AppError> {
        self.inner.refresh(target).await
    }
}

struct FaultCursor {
    inner: Box<dyn ScanCursor>,
    fail_at: Option<usize>,
    served: usize,
}

#[async_trait]
impl ScanCursor for FaultCursor {
    async fn next_batch(&mut self) -> Result<Option<Vec<Document>>, AppError> {
        if self.fail_at == Some(self.served) {
            return Err(AppError::Transient("search_context_missing_exception".to_string()));
        }
        self.served += 1;
        self.inner.next_batch().await
    }

    async fn clear(&mut self) -> Result<(), AppError> {
        self.inner.clear().await
    }
}
