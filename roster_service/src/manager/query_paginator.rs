use crate::entitys::participant::ParticipantRecord;
use crate::shard_router::ShardRouter;
use crate::store::{DocumentStore, OrderType, RosterFilter, ScanCursor, ShardTarget};
use common::ChannelId;
use common::config::RosterConfig;
use common::errors::AppError;
use log::{debug, warn};
use mongodb::bson::{self, Document};
use std::sync::Arc;
use std::time::Duration;

/// 查询窗口，`limit = None` 表示不限条数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub limit: Option<u64>,
    pub offset: u64,
}

impl Window {
    pub fn new(limit: u64, offset: u64) -> Self {
        Self { limit: Some(limit), offset }
    }

    pub fn unbounded() -> Self {
        Self { limit: None, offset: 0 }
    }

    /// 兼容旧的整数约定：limit 为负数表示全部
    pub fn from_legacy(limit: i64, offset: i64) -> Self {
        Self { limit: u64::try_from(limit).ok(), offset: offset.max(0) as u64 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPage {
    pub items: Vec<ParticipantRecord>,
    /// 精确匹配总数（与窗口无关）
    pub total: u64,
}

/// 双模式分页：窗口较小时直接 skip/limit，窗口过深或不限条数时改走游标扫描
#[derive(Clone)]
pub struct QueryPaginator {
    store: Arc<dyn DocumentStore>,
    router: ShardRouter,
    page_window_max: u64,
    scan_batch: u32,
    keep_alive: Duration,
}

impl QueryPaginator {
    pub fn new(store: Arc<dyn DocumentStore>, router: ShardRouter, cfg: &RosterConfig) -> Self {
        Self {
            store,
            router,
            page_window_max: cfg.page_window_max,
            scan_batch: cfg.scan_batch.max(1),
            keep_alive: Duration::from_secs(cfg.scan_keep_alive_secs),
        }
    }

    pub async fn query(&self, channel_id: ChannelId, filter: &RosterFilter, window: Window) -> Result<QueryPage, AppError> {
        if filter.channel_id != channel_id {
            return Err(AppError::Precondition(format!("filter channel {} != {}", filter.channel_id, channel_id)));
        }
        let target = self.router.target(channel_id)?;
        match window.limit {
            Some(limit) if window.offset.saturating_add(limit) <= self.page_window_max => {
                self.bounded(&target, filter, window.offset, limit).await
            }
            _ => self.deep(&target, filter, window).await,
        }
    }

    async fn bounded(&self, target: &ShardTarget, filter: &RosterFilter, offset: u64, limit: u64) -> Result<QueryPage, AppError> {
        let page = self.store.search(target, filter, OrderType::Desc, offset, limit).await?;
        let items = page.hits.into_iter().filter_map(|d| decode(target, d)).collect();
        Ok(QueryPage { items, total: page.total })
    }

    async fn deep(&self, target: &ShardTarget, filter: &RosterFilter, window: Window) -> Result<QueryPage, AppError> {
        debug!("deep scan {} offset={} limit={:?}", target.container, window.offset, window.limit);
        let mut cursor = self.store.open_scan(target, filter, OrderType::Desc, self.scan_batch, self.keep_alive).await?;
        let drained = drain(cursor.as_mut(), target, window).await;
        // 无论成功与否都释放游标
        if let Err(e) = cursor.clear().await {
            warn!("⚠️ clear scan cursor on {} failed: {}", target.container, e);
        }
        let (items, scanned, exhausted) = drained?;
        let total = if exhausted { scanned } else { self.store.count(target, filter).await? };
        Ok(QueryPage { items, total })
    }
}

/// 跳过 offset 条原始命中后收集，直到凑满 limit 或扫完；返回 (结果, 已扫描数, 是否扫完)
async fn drain(cursor: &mut dyn ScanCursor, target: &ShardTarget, window: Window) -> Result<(Vec<ParticipantRecord>, u64, bool), AppError> {
    let mut items = Vec::new();
    let mut scanned = 0u64;
    if window.limit == Some(0) {
        return Ok((items, scanned, false));
    }
    while let Some(batch) = cursor.next_batch().await? {
        for doc in batch {
            scanned += 1;
            if scanned <= window.offset {
                continue;
            }
            if let Some(rec) = decode(target, doc) {
                items.push(rec);
            }
            if window.limit.is_some_and(|l| items.len() as u64 >= l) {
                return Ok((items, scanned, false));
            }
        }
    }
    Ok((items, scanned, true))
}

/// 损坏文档记告警后跳过
fn decode(target: &ShardTarget, doc: Document) -> Option<ParticipantRecord> {
    let id = doc.get_str("_id").map(str::to_string).unwrap_or_default();
    match bson::from_document::<ParticipantRecord>(doc) {
        Ok(rec) => Some(rec),
        Err(e) => {
            warn!("⚠️ skip malformed participant {} in {}: {}", id, target.container, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fault_store::FaultStore;
    use crate::store::{BulkMode, BulkOperation};
    use common::UserId;
    use mongodb::bson::doc;

    const CID: ChannelId = 4242;

    fn body(uid: UserId, admin: bool) -> Document {
        doc! {
            "channel_id": CID, "user_id": uid,
            "is_creator": 0, "admin_rights": if admin { 1 } else { 0 },
            "is_left": 0, "is_kicked": 0, "hidden_participant": 0,
        }
    }

    /// 1..=n 中偶数为管理员
    async fn seeded(n: i64) -> Arc<FaultStore> {
        let store = Arc::new(FaultStore::new());
        let target = ShardRouter::new(1000).unwrap().target(CID).unwrap();
        let ops: Vec<BulkOperation> =
            (1..=n).map(|uid| BulkOperation::new(ShardRouter::participant_key(CID, uid), uid, body(uid, uid % 2 == 0))).collect();
        store.inner.bulk(&target, BulkMode::Index, &ops).await.unwrap();
        store
    }

    fn paginator(store: Arc<FaultStore>, window_max: u64, batch: u32) -> QueryPaginator {
        let cfg = RosterConfig { page_window_max: window_max, scan_batch: batch, ..Default::default() };
        QueryPaginator::new(store, ShardRouter::new(1000).unwrap(), &cfg)
    }

    fn ids(page: &QueryPage) -> Vec<UserId> {
        page.items.iter().map(|r| r.user_id).collect()
    }

    #[tokio::test]
    async fn unbounded_returns_every_match_descending() {
        let store = seeded(50).await;
        let p = paginator(store.clone(), 10_000, 7);
        let page = p.query(CID, &RosterFilter::elevated(CID), Window::unbounded()).await.unwrap();
        assert_eq!(page.total, 25);
        let expected: Vec<UserId> = (1..=50).rev().filter(|u| u % 2 == 0).collect();
        assert_eq!(ids(&page), expected);
        assert_eq!(store.inner.open_scan_count(), 0);
    }

    #[tokio::test]
    async fn both_modes_agree() {
        let store = seeded(60).await;
        let shallow = paginator(store.clone(), 10_000, 4);
        let deep = paginator(store.clone(), 5, 4);
        let filter = RosterFilter::elevated(CID);
        for (limit, offset) in [(5, 0), (7, 3), (10, 25), (4, 29)] {
            let a = shallow.query(CID, &filter, Window::new(limit, offset)).await.unwrap();
            let b = deep.query(CID, &filter, Window::new(limit, offset)).await.unwrap();
            assert_eq!(ids(&a), ids(&b), "limit={} offset={}", limit, offset);
            assert_eq!(a.total, 30);
            assert_eq!(b.total, 30);
        }
        assert_eq!(store.inner.open_scan_count(), 0);
    }

    #[tokio::test]
    async fn zero_limit_returns_total_only() {
        let store = seeded(10).await;
        let p = paginator(store, 10_000, 3);
        let page = p.query(CID, &RosterFilter::channel(CID), Window::new(0, 0)).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 10);
    }

    #[tokio::test]
    async fn malformed_documents_are_skipped() {
        let store = seeded(6).await;
        let target = ShardRouter::new(1000).unwrap().target(CID).unwrap();
        let mut bad = body(100, true);
        bad.insert("rank", 9);
        store.inner.insert_raw(&target, "channel:4242:100", bad);
        let p = paginator(store.clone(), 10_000, 2);
        let page = p.query(CID, &RosterFilter::elevated(CID), Window::unbounded()).await.unwrap();
        assert_eq!(ids(&page), vec![6, 4, 2]);
        assert_eq!(page.total, 4);
    }

    #[tokio::test]
    async fn cursor_released_when_scan_fails() {
        let store = seeded(20).await;
        *store.scan_fail_at.lock().unwrap() = Some(1);
        let p = paginator(store.clone(), 10_000, 3);
        let out = p.query(CID, &RosterFilter::channel(CID), Window::unbounded()).await;
        assert!(out.is_err());
        assert_eq!(store.inner.open_scan_count(), 0);
    }

    #[tokio::test]
    async fn offset_past_end_and_channel_mismatch() {
        let store = seeded(8).await;
        let p = paginator(store, 3, 2);
        let page = p.query(CID, &RosterFilter::channel(CID), Window::new(5, 100)).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 8);
        assert!(p.query(CID, &RosterFilter::channel(CID + 1), Window::unbounded()).await.is_err());
        assert_eq!(Window::from_legacy(-1, 5), Window { limit: None, offset: 5 });
    }
}
