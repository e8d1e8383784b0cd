//! 两类后端存储的接口边界
//!
//! * [`DocumentStore`]：权威文档存储（MongoDB），支持过滤、排序、分页与游标扫描
//! * [`CacheStore`]：成员缓存（Redis），set 视图 + 逗号分隔字符串视图
//!
//! 业务层只依赖这两个 trait，具体连接句柄在启动时构造后注入。

use crate::entitys::channel_meta::{ChannelMeta, MetaUpdate};
use crate::shard_router::ShardRouter;
use async_trait::async_trait;
use common::errors::AppError;
use common::{ChannelId, UserId};
use mongodb::bson::{Bson, Document, doc};
use std::time::Duration;

pub mod local_cache;
pub mod local_store;
pub mod mongo_store;
pub mod redis_cache;

#[cfg(test)]
pub(crate) mod fault_store;

/// 某个频道所在的物理分片 + 路由 key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTarget {
    pub container: String,
    pub channel_id: ChannelId,
}

impl ShardTarget {
    pub fn routing(&self) -> String {
        ShardRouter::routing_key(self.channel_id)
    }

    pub fn meta_key(&self) -> String {
        ShardRouter::meta_key(self.channel_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderType {
    Asc,
    #[default]
    Desc,
}

/// 成员查询 / 删除过滤条件，总是限定 channel_id 且排除 meta 文档
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterFilter {
    pub channel_id: ChannelId,
    pub user_ids: Option<Vec<UserId>>,
    pub elevated_only: bool,
}

impl RosterFilter {
    /// 频道内全部成员
    pub fn channel(channel_id: ChannelId) -> Self {
        Self { channel_id, user_ids: None, elevated_only: false }
    }

    /// 频道内指定用户
    pub fn users(channel_id: ChannelId, user_ids: Vec<UserId>) -> Self {
        Self { channel_id, user_ids: Some(user_ids), elevated_only: false }
    }

    /// is_left = 0 AND is_kicked = 0 AND hidden_participant = 0 AND (is_creator = 1 OR admin_rights > 0)
    pub fn elevated(channel_id: ChannelId) -> Self {
        Self { channel_id, user_ids: None, elevated_only: true }
    }

    /// 转成 MongoDB 查询文档
    pub fn to_document(&self) -> Document {
        let mut filter = doc! {
            "channel_id": self.channel_id,
            "_id": { "$ne": ShardRouter::meta_key(self.channel_id) },
        };
        if let Some(ids) = &self.user_ids {
            filter.insert("user_id", doc! { "$in": ids.clone() });
        }
        if self.elevated_only {
            filter.insert("is_left", 0);
            filter.insert("is_kicked", 0);
            filter.insert("hidden_participant", 0);
            filter.insert("$or", vec![doc! { "is_creator": 1 }, doc! { "admin_rights": { "$gt": 0 } }]);
        }
        filter
    }

    /// 在内存中对原始文档求值，语义与 `to_document` 保持一致
    pub fn matches(&self, id: &str, doc: &Document) -> bool {
        if id == ShardRouter::meta_key(self.channel_id) {
            return false;
        }
        if doc_i64(doc, "channel_id") != Some(self.channel_id) {
            return false;
        }
        if let Some(ids) = &self.user_ids {
            match doc_i64(doc, "user_id") {
                Some(uid) if ids.contains(&uid) => {}
                _ => return false,
            }
        }
        if self.elevated_only {
            let zero = |f: &str| doc_i64(doc, f) == Some(0);
            if !(zero("is_left") && zero("is_kicked") && zero("hidden_participant")) {
                return false;
            }
            let creator = doc_i64(doc, "is_creator") == Some(1);
            let admin = doc_i64(doc, "admin_rights").is_some_and(|v| v > 0);
            if !(creator || admin) {
                return false;
            }
        }
        true
    }
}

/// 读取数值字段，兼容 Int32 / Int64 / Double
pub fn doc_i64(doc: &Document, field: &str) -> Option<i64> {
    match doc.get(field) {
        Some(Bson::Int32(v)) => Some(*v as i64),
        Some(Bson::Int64(v)) => Some(*v),
        Some(Bson::Double(v)) => Some(*v as i64),
        _ => None,
    }
}

/// 批量写入模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// 全量覆盖写（文档整体替换）
    Index,
    /// 部分字段更新，不存在则插入
    Upsert,
}

/// 单条批量写入请求
#[derive(Debug, Clone)]
pub struct BulkOperation {
    pub doc_id: String,
    pub user_id: UserId,
    pub body: Document,
    /// 序列化后的大致字节数，用于按大小切批
    pub size: usize,
}

impl BulkOperation {
    pub fn new(doc_id: String, user_id: UserId, body: Document) -> Self {
        let size = mongodb::bson::to_vec(&body).map(|v| v.len()).unwrap_or(doc_id.len());
        Self { doc_id, user_id, body, size }
    }
}

/// 批量写入中单条的结果，`error` 为 None 表示成功
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub doc_id: String,
    pub user_id: UserId,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFailureKind {
    /// 已不存在，视为成功
    NotFound,
    /// 版本冲突等软失败，记告警继续
    Conflict,
    /// 硬失败，整个调用报错
    Hard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub doc_id: Option<String>,
    pub kind: DeleteFailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteByFilterResult {
    pub deleted: u64,
    pub failures: Vec<DeleteFailure>,
}

/// 一页检索结果（原始文档 + 精确总数）
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: Vec<Document>,
    pub total: u64,
}

/// 文档存储边界；每个调用都带 `ShardTarget`，保证单频道请求只打到一个分区
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 分片容器不存在则创建，"已存在" 视为成功
    async fn ensure_container(&self, target: &ShardTarget) -> Result<(), AppError>;

    /// 批量写入，单条失败体现在返回值里而不是整体报错
    async fn bulk(&self, target: &ShardTarget, mode: BulkMode, ops: &[BulkOperation]) -> Result<Vec<BulkItemResult>, AppError>;

    async fn delete_by_filter(&self, target: &ShardTarget, filter: &RosterFilter) -> Result<DeleteByFilterResult, AppError>;

    /// 读取 meta 文档，不存在返回 None
    async fn get_meta(&self, target: &ShardTarget) -> Result<Option<ChannelMeta>, AppError>;

    /// meta 条件更新（服务端原子执行），并发写冲突返回 `AppError::Conflict`
    async fn apply_meta(&self, target: &ShardTarget, update: MetaUpdate) -> Result<ChannelMeta, AppError>;

    /// 按 user_id 排序的分页检索，`total` 为精确匹配数
    async fn search(&self, target: &ShardTarget, filter: &RosterFilter, order: OrderType, from: u64, size: u64) -> Result<SearchPage, AppError>;

    async fn count(&self, target: &ShardTarget, filter: &RosterFilter) -> Result<u64, AppError>;

    /// 打开只进游标，调用方必须在结束时 `clear`
    async fn open_scan(
        &self,
        target: &ShardTarget,
        filter: &RosterFilter,
        order: OrderType,
        batch_size: u32,
        keep_alive: Duration,
    ) -> Result<Box<dyn ScanCursor>, AppError>;

    /// 强制可见性刷新，保证随后的读能看到刚写入的数据
    async fn refresh(&self, target: &ShardTarget) -> Result<(), AppError>;
}

/// 游标扫描句柄
#[async_trait]
pub trait ScanCursor: Send {
    /// 下一批原始文档，None 表示已扫完
    async fn next_batch(&mut self) -> Result<Option<Vec<Document>>, AppError>;

    /// 释放服务端游标资源
    async fn clear(&mut self) -> Result<(), AppError>;
}

/// 字符串视图的改写函数，可能被重复调用（冲突重试）
pub type StringUpdate<'a> = dyn Fn(Option<&str>) -> Option<String> + Send + Sync + 'a;

/// 缓存存储边界
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, AppError>;

    /// 返回新加入的成员数
    async fn set_add(&self, key: &str, members: &[UserId]) -> Result<u64, AppError>;

    /// 原子地整体替换（先删后加）
    async fn set_replace(&self, key: &str, members: &[UserId]) -> Result<(), AppError>;

    /// 返回 (实际移除数, 剩余数)
    async fn set_remove(&self, key: &str, members: &[UserId]) -> Result<(u64, u64), AppError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, AppError>;

    async fn set_contains(&self, key: &str, member: UserId) -> Result<bool, AppError>;

    async fn get_string(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn set_string(&self, key: &str, value: &str) -> Result<(), AppError>;

    /// 字符串视图的原子读-改-写：`update` 拿到当前值（不存在为 None），
    /// 返回新值，返回 None 表示删除 key。并发修改同一个 key 不会互相覆盖。
    async fn update_string(&self, key: &str, update: &StringUpdate<'_>) -> Result<(), AppError>;

    async fn delete(&self, key: &str) -> Result<bool, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(cid: i64, uid: i64) -> Document {
        doc! { "channel_id": cid, "user_id": uid, "is_left": 0, "is_kicked": 0, "hidden_participant": 0, "is_creator": 0, "admin_rights": 0 }
    }

    #[test]
    fn elevated_filter_requires_role() {
        let f = RosterFilter::elevated(5);
        let mut d = member(5, 1);
        assert!(!f.matches("channel:5:1", &d));
        d.insert("admin_rights", 2);
        assert!(f.matches("channel:5:1", &d));
        d.insert("is_kicked", 1);
        assert!(!f.matches("channel:5:1", &d));
    }

    #[test]
    fn meta_and_foreign_channel_never_match() {
        let f = RosterFilter::channel(5);
        assert!(!f.matches("channel:5:meta", &doc! { "channel_id": 5, "version": 3 }));
        assert!(!f.matches("channel:6:1", &member(6, 1)));
        assert!(f.matches("channel:5:1", &member(5, 1)));
    }

    #[test]
    fn user_filter_and_mongo_document() {
        let f = RosterFilter::users(5, vec![1, 3]);
        assert!(f.matches("channel:5:3", &member(5, 3)));
        assert!(!f.matches("channel:5:2", &member(5, 2)));
        let d = f.to_document();
        assert_eq!(d.get_i64("channel_id").unwrap(), 5);
        assert_eq!(d.get_document("_id").unwrap().get_str("$ne").unwrap(), "channel:5:meta");
        assert!(d.get_document("user_id").unwrap().contains_key("$in"));
        assert!(RosterFilter::elevated(5).to_document().contains_key("$or"));
    }
}
