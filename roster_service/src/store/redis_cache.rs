use crate::store::{CacheStore, StringUpdate};
use async_trait::async_trait;
use common::errors::AppError;
use common::{RedisPool, UserId};
use deadpool_redis::redis::{cmd, pipe};
use log::debug;

/// 字符串视图乐观更新的最大尝试次数
const STRING_CAS_ATTEMPTS: usize = 32;

/// 基于 Redis 的成员缓存：set 存成员，字符串存逗号分隔的 id 列表
#[derive(Clone)]
pub struct RedisCacheStore {
    pool: RedisPool,
}

impl RedisCacheStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore").field("pool", &"Pool(...)").finish()
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn set_add(&self, key: &str, members: &[UserId]) -> Result<u64, AppError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let added: u64 = cmd("SADD").arg(key).arg(members).query_async(&mut conn).await?;
        Ok(added)
    }

    async fn set_replace(&self, key: &str, members: &[UserId]) -> Result<(), AppError> {
        let mut conn = self.pool.get().await?;
        if members.is_empty() {
            let _: i64 = cmd("DEL").arg(key).query_async(&mut conn).await?;
            return Ok(());
        }
        // MULTI/EXEC 保证读者看不到删了一半的中间态
        let _: () = pipe()
            .atomic()
            .cmd("DEL")
            .arg(key)
            .ignore()
            .cmd("SADD")
            .arg(key)
            .arg(members)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[UserId]) -> Result<(u64, u64), AppError> {
        let mut conn = self.pool.get().await?;
        if members.is_empty() {
            let remain: u64 = cmd("SCARD").arg(key).query_async(&mut conn).await?;
            return Ok((0, remain));
        }
        let (removed, remain): (u64, u64) = pipe()
            .atomic()
            .cmd("SREM")
            .arg(key)
            .arg(members)
            .cmd("SCARD")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok((removed, remain))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.pool.get().await?;
        let members: Vec<String> = cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn set_contains(&self, key: &str, member: UserId) -> Result<bool, AppError> {
        let mut conn = self.pool.get().await?;
        let hit: i64 = cmd("SISMEMBER").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(hit == 1)
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.pool.get().await?;
        let val: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(val)
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<(), AppError> {
        let mut conn = self.pool.get().await?;
        let _: () = cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn update_string(&self, key: &str, update: &StringUpdate<'_>) -> Result<(), AppError> {
        let mut conn = self.pool.get().await?;
        for attempt in 1..=STRING_CAS_ATTEMPTS {
            // WATCH 之后 key 被其它连接改过，EXEC 返回 nil
            let _: () = cmd("WATCH").arg(key).query_async(&mut conn).await?;
            let current: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
            let mut tx = pipe();
            tx.atomic();
            match update(current.as_deref()) {
                Some(value) => tx.cmd("SET").arg(key).arg(value).ignore(),
                None => tx.cmd("DEL").arg(key).ignore(),
            };
            let committed: Option<()> = tx.query_async(&mut conn).await?;
            if committed.is_some() {
                return Ok(());
            }
            debug!("string view {} changed under us, attempt {}", key, attempt);
        }
        Err(AppError::Conflict(format!("string view {} kept changing", key)))
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }
}
