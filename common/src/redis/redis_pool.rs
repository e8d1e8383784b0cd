use crate::RedisPool;
use crate::errors::AppError;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Runtime};

/// 创建 Redis 连接池（程序启动时调用一次，之后 clone 句柄注入各组件）
pub fn build_redis_pool(redis_url: &str) -> Result<RedisPool, AppError> {
    if redis_url.is_empty() {
        return Err(AppError::Precondition("redis url is empty".to_string()));
    }
    let cfg = Config::from_url(redis_url);
    cfg.create_pool(Some(Runtime::Tokio1))
        .map_err(|e| AppError::Internal(format!("create redis pool: {}", e)))
}

/// 健康检查
pub async fn ping_redis(pool: &RedisPool) -> Result<(), AppError> {
    let mut conn = pool.get().await?;
    let _: String = cmd("PING").query_async(&mut conn).await?;
    Ok(())
}
