use crate::shard_router::ShardRouter;
use crate::store::{DeleteFailureKind, DocumentStore, RosterFilter, ShardTarget};
use common::errors::AppError;
use common::{ChannelId, UserId};
use log::{debug, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: u64,
    pub chunks: usize,
    /// 软失败（冲突）条数，已记告警
    pub warnings: usize,
}

/// 按 user_id 分块删除频道成员，meta 文档永远不受影响
#[derive(Clone)]
pub struct BulkDeleter {
    store: Arc<dyn DocumentStore>,
    router: ShardRouter,
    chunk_size: usize,
}

impl BulkDeleter {
    pub fn new(store: Arc<dyn DocumentStore>, router: ShardRouter, chunk_size: usize) -> Self {
        Self { store, router, chunk_size: chunk_size.max(1) }
    }

    pub async fn delete_users(&self, channel_id: ChannelId, user_ids: &[UserId]) -> Result<DeleteReport, AppError> {
        let target = self.router.target(channel_id)?;
        let mut report = DeleteReport::default();
        if user_ids.is_empty() {
            return Ok(report);
        }
        for (idx, chunk) in user_ids.chunks(self.chunk_size).enumerate() {
            let filter = RosterFilter::users(channel_id, chunk.to_vec());
            self.delete_chunk(&target, idx, &filter, &mut report).await?;
        }
        info!(
            "channel {} deleted {} of {} users in {} chunks ({} warnings)",
            channel_id,
            report.deleted,
            user_ids.len(),
            report.chunks,
            report.warnings
        );
        Ok(report)
    }

    /// 清空频道全部成员（全量重载前使用）
    pub async fn delete_all(&self, channel_id: ChannelId) -> Result<DeleteReport, AppError> {
        let target = self.router.target(channel_id)?;
        let mut report = DeleteReport::default();
        self.delete_chunk(&target, 0, &RosterFilter::channel(channel_id), &mut report).await?;
        debug!("channel {} purged {} participants", channel_id, report.deleted);
        Ok(report)
    }

    async fn delete_chunk(&self, target: &ShardTarget, idx: usize, filter: &RosterFilter, report: &mut DeleteReport) -> Result<(), AppError> {
        let result = self.store.delete_by_filter(target, filter).await.map_err(|e| AppError::DeleteChunk { chunk: idx, reason: e.to_string() })?;
        report.chunks += 1;
        report.deleted += result.deleted;
        for failure in result.failures {
            let doc_id = failure.doc_id.as_deref().unwrap_or("-");
            match failure.kind {
                DeleteFailureKind::NotFound => debug!("delete chunk {}: {} already gone", idx, doc_id),
                DeleteFailureKind::Conflict => {
                    warn!("⚠️ delete chunk {}: conflict on {}: {}", idx, doc_id, failure.reason);
                    report.warnings += 1;
                }
                DeleteFailureKind::Hard => {
                    return Err(AppError::DeleteChunk { chunk: idx, reason: format!("{}: {}", doc_id, failure.reason) });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitys::channel_meta::MetaUpdate;
    use crate::store::fault_store::FaultStore;
    use crate::store::{BulkMode, BulkOperation};
    use mongodb::bson::doc;

    const CID: ChannelId = 21;

    async fn seeded(n: i64) -> (Arc<FaultStore>, ShardTarget, ShardRouter) {
        let store = Arc::new(FaultStore::new());
        let router = ShardRouter::new(1000).unwrap();
        let target = router.target(CID).unwrap();
        let ops: Vec<BulkOperation> = (1..=n)
            .map(|uid| BulkOperation::new(ShardRouter::participant_key(CID, uid), uid, doc! { "channel_id": CID, "user_id": uid }))
            .collect();
        store.inner.bulk(&target, BulkMode::Index, &ops).await.unwrap();
        store.inner.apply_meta(&target, MetaUpdate::Set { version: 4, updated_at: 1 }).await.unwrap();
        (store, target, router)
    }

    #[tokio::test]
    async fn deletes_in_chunks_and_is_idempotent() {
        let (store, target, router) = seeded(10).await;
        let deleter = BulkDeleter::new(store.clone(), router, 3);
        let ids: Vec<UserId> = (1..=10).collect();
        let report = deleter.delete_users(CID, &ids).await.unwrap();
        assert_eq!(report, DeleteReport { deleted: 10, chunks: 4, warnings: 0 });
        // 只剩 meta
        assert_eq!(store.inner.doc_count(&target), 1);

        let again = deleter.delete_users(CID, &ids).await.unwrap();
        assert_eq!(again.deleted, 0);
        assert_eq!(store.inner.get_meta(&target).await.unwrap().unwrap().version, 4);
    }

    #[tokio::test]
    async fn empty_ids_is_noop() {
        let (store, target, router) = seeded(3).await;
        let deleter = BulkDeleter::new(store.clone(), router, 1000);
        assert_eq!(deleter.delete_users(CID, &[]).await.unwrap(), DeleteReport::default());
        assert_eq!(store.inner.doc_count(&target), 4);
    }

    #[tokio::test]
    async fn invalid_channel_is_rejected_up_front() {
        let (store, _, router) = seeded(1).await;
        let deleter = BulkDeleter::new(store, router, 1000);
        assert!(matches!(deleter.delete_users(0, &[1]).await, Err(AppError::Precondition(_))));
        assert!(matches!(deleter.delete_all(-3).await, Err(AppError::Precondition(_))));
    }

    #[tokio::test]
    async fn conflict_warns_and_hard_failure_aborts() {
        let (store, _, router) = seeded(9).await;
        let deleter = BulkDeleter::new(store.clone(), router, 3);

        *store.delete_fault.lock().unwrap() = Some((2, DeleteFailureKind::Conflict));
        let report = deleter.delete_users(CID, &[1, 2, 3]).await.unwrap();
        assert_eq!(report.warnings, 1);

        *store.delete_fault.lock().unwrap() = Some((5, DeleteFailureKind::NotFound));
        assert_eq!(deleter.delete_users(CID, &[4, 5]).await.unwrap().warnings, 0);

        *store.delete_fault.lock().unwrap() = Some((8, DeleteFailureKind::Hard));
        let err = deleter.delete_users(CID, &[6, 7, 9, 8]).await.unwrap_err();
        assert!(matches!(err, AppError::DeleteChunk { chunk: 1, .. }));
    }

    #[tokio::test]
    async fn delete_all_keeps_meta() {
        let (store, target, router) = seeded(5).await;
        let deleter = BulkDeleter::new(store.clone(), router, 2);
        assert_eq!(deleter.delete_all(CID).await.unwrap().deleted, 5);
        assert_eq!(store.inner.doc_count(&target), 1);
        assert!(store.inner.get_meta(&target).await.unwrap().is_some());
    }
}
