pub mod config;
pub mod db;
pub mod errors;
pub mod redis;
pub mod util;

/// 频道 ID（分片键）
pub type ChannelId = i64;
/// 用户 ID（频道内唯一）
pub type UserId = i64;

pub type RedisPool = deadpool_redis::Pool;
