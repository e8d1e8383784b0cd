use crate::entitys::channel_meta::{ChannelMeta, MetaUpdate};
use crate::store::{
    BulkItemResult, BulkMode, BulkOperation, DeleteByFilterResult, DocumentStore, OrderType, RosterFilter, ScanCursor, SearchPage,
    ShardTarget,
};
use async_trait::async_trait;
use common::errors::AppError;
use dashmap::DashSet;
use futures::TryStreamExt;
use log::{debug, warn};
use mongodb::bson::{self, Document, doc};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ReplaceOneModel, ReturnDocument, UpdateOneModel, WriteModel};
use mongodb::{Client, Collection, Cursor, Database};
use std::time::Duration;

/// 集合已存在
const NAMESPACE_EXISTS: i32 = 48;
/// 唯一键冲突（并发 upsert 同一个 _id）
const DUPLICATE_KEY: i32 = 11000;

/// 基于 MongoDB 的文档存储：每个分片是一个集合，文档 `_id` 即确定性 key
///
/// 批量写入走 `Client::bulk_write`（需要 MongoDB 8.0+）
#[derive(Debug, Clone)]
pub struct MongoDocumentStore {
    client: Client,
    db: Database,
    /// 已确认存在的集合，避免每次都发 create
    known: std::sync::Arc<DashSet<String>>,
}

impl MongoDocumentStore {
    pub fn new(client: Client, db: Database) -> Self {
        Self { client, db, known: Default::default() }
    }

    fn collection(&self, target: &ShardTarget) -> Collection<Document> {
        self.db.collection::<Document>(&target.container)
    }
}

fn error_code(e: &MongoError) -> Option<i32> {
    match e.kind.as_ref() {
        ErrorKind::Command(c) => Some(c.code),
        ErrorKind::Write(WriteFailure::WriteError(w)) => Some(w.code),
        _ => None,
    }
}

fn map_meta_error(e: MongoError) -> AppError {
    if error_code(&e) == Some(DUPLICATE_KEY) {
        AppError::Conflict(format!("meta upsert raced: {}", e))
    } else {
        AppError::from(e)
    }
}

/// 按下标把逐条错误写回结果，越界下标记告警后忽略
fn mark_item_errors<'a>(results: &mut [BulkItemResult], errors: impl IntoIterator<Item = (usize, i32, &'a str)>) {
    for (idx, code, message) in errors {
        match results.get_mut(idx) {
            Some(item) => item.error = Some(format!("code {}: {}", code, message)),
            None => warn!("bulk write error for unknown index {}: code {}", idx, code),
        }
    }
}

fn sort_doc(order: OrderType) -> Document {
    match order {
        OrderType::Asc => doc! { "user_id": 1 },
        OrderType::Desc => doc! { "user_id": -1 },
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn ensure_container(&self, target: &ShardTarget) -> Result<(), AppError> {
        if self.known.contains(&target.container) {
            return Ok(());
        }
        match self.db.create_collection(&target.container).await {
            Ok(()) => debug!("created collection {}", target.container),
            // 多个进程同时创建
            Err(e) if error_code(&e) == Some(NAMESPACE_EXISTS) => {}
            Err(e) => return Err(e.into()),
        }
        self.known.insert(target.container.clone());
        Ok(())
    }

    async fn bulk(&self, target: &ShardTarget, mode: BulkMode, ops: &[BulkOperation]) -> Result<Vec<BulkItemResult>, AppError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let ns = self.collection(target).namespace();
        let models: Vec<WriteModel> = ops
            .iter()
            .map(|op| match mode {
                BulkMode::Index => WriteModel::ReplaceOne(
                    ReplaceOneModel::builder()
                        .namespace(ns.clone())
                        .filter(doc! { "_id": op.doc_id.as_str() })
                        .replacement(op.body.clone())
                        .upsert(true)
                        .build(),
                ),
                BulkMode::Upsert => WriteModel::UpdateOne(
                    UpdateOneModel::builder()
                        .namespace(ns.clone())
                        .filter(doc! { "_id": op.doc_id.as_str() })
                        .update(doc! { "$set": op.body.clone() })
                        .upsert(true)
                        .build(),
                ),
            })
            .collect();

        let mut results: Vec<BulkItemResult> =
            ops.iter().map(|op| BulkItemResult { doc_id: op.doc_id.clone(), user_id: op.user_id, error: None }).collect();

        match self.client.bulk_write(models).ordered(false).await {
            Ok(_) => Ok(results),
            Err(e) => match e.kind.as_ref() {
                // 非有序批量：逐条错误落到对应下标，其余条目照常成功
                ErrorKind::BulkWrite(bw) if !bw.write_errors.is_empty() => {
                    mark_item_errors(&mut results, bw.write_errors.iter().map(|(idx, we)| (*idx, we.code, we.message.as_str())));
                    if !bw.write_concern_errors.is_empty() {
                        warn!("bulk write concern errors on {}: {:?}", target.container, bw.write_concern_errors);
                    }
                    Ok(results)
                }
                _ => Err(e.into()),
            },
        }
    }

    async fn delete_by_filter(&self, target: &ShardTarget, filter: &RosterFilter) -> Result<DeleteByFilterResult, AppError> {
        let result = self.collection(target).delete_many(filter.to_document()).await?;
        Ok(DeleteByFilterResult { deleted: result.deleted_count, failures: Vec::new() })
    }

    async fn get_meta(&self, target: &ShardTarget) -> Result<Option<ChannelMeta>, AppError> {
        let found = self.collection(target).find_one(doc! { "_id": target.meta_key() }).await?;
        match found {
            Some(d) => Ok(Some(bson::from_document(d)?)),
            None => Ok(None),
        }
    }

    async fn apply_meta(&self, target: &ShardTarget, update: MetaUpdate) -> Result<ChannelMeta, AppError> {
        let update_doc = match update {
            MetaUpdate::Increment { updated_at } => doc! {
                "$inc": { "version": 1i64 },
                "$set": { "updated_at": updated_at },
                "$setOnInsert": { "channel_id": target.channel_id },
            },
            MetaUpdate::Set { version, updated_at } => doc! {
                "$set": { "channel_id": target.channel_id, "version": version, "updated_at": updated_at },
            },
        };
        let after = self
            .collection(target)
            .find_one_and_update(doc! { "_id": target.meta_key() }, update_doc)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(map_meta_error)?;
        match after {
            Some(d) => Ok(bson::from_document(d)?),
            None => Err(AppError::NotFound),
        }
    }

    async fn search(&self, target: &ShardTarget, filter: &RosterFilter, order: OrderType, from: u64, size: u64) -> Result<SearchPage, AppError> {
        let coll = self.collection(target);
        let query = filter.to_document();
        let total = coll.count_documents(query.clone()).await?;
        // limit(0) 在 MongoDB 里表示不限制
        if size == 0 || from >= total {
            return Ok(SearchPage { hits: Vec::new(), total });
        }
        let cursor = coll.find(query).sort(sort_doc(order)).skip(from).limit(size as i64).await?;
        let hits: Vec<Document> = cursor.try_collect().await?;
        Ok(SearchPage { hits, total })
    }

    async fn count(&self, target: &ShardTarget, filter: &RosterFilter) -> Result<u64, AppError> {
        Ok(self.collection(target).count_documents(filter.to_document()).await?)
    }

    async fn open_scan(
        &self,
        target: &ShardTarget,
        filter: &RosterFilter,
        order: OrderType,
        batch_size: u32,
        keep_alive: Duration,
    ) -> Result<Box<dyn ScanCursor>, AppError> {
        let cursor = self.collection(target).find(filter.to_document()).sort(sort_doc(order)).batch_size(batch_size).await?;
        Ok(Box::new(MongoScanCursor { cursor: Some(cursor), batch_size: batch_size as usize, keep_alive }))
    }

    async fn refresh(&self, target: &ShardTarget) -> Result<(), AppError> {
        // 主节点读写本身即可见，无需额外刷新
        debug!("refresh {} (no-op for mongodb)", target.container);
        Ok(())
    }
}

/// MongoDB 游标包装：按批收集，`clear` 或 drop 时驱动 killCursors
pub struct MongoScanCursor {
    cursor: Option<Cursor<Document>>,
    batch_size: usize,
    /// 单批拉取允许的最长时间
    keep_alive: Duration,
}

#[async_trait]
impl ScanCursor for MongoScanCursor {
    async fn next_batch(&mut self) -> Result<Option<Vec<Document>>, AppError> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        let batch_size = self.batch_size;
        let keep_alive = self.keep_alive;
        let fetch = async {
            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                match cursor.try_next().await? {
                    Some(d) => batch.push(d),
                    None => break,
                }
            }
            Ok::<_, AppError>(batch)
        };
        let batch = tokio::time::timeout(keep_alive, fetch)
            .await
            .map_err(|_| AppError::Timeout(format!("scan batch exceeded {:?}", keep_alive)))??;
        if batch.is_empty() {
            self.cursor = None;
            return Ok(None);
        }
        Ok(Some(batch))
    }

    async fn clear(&mut self) -> Result<(), AppError> {
        // Cursor 在 drop 时向服务端发送 killCursors
        self.cursor.take();
        Ok(())
    }
}
