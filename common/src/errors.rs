use deadpool_redis::PoolError;
use deadpool_redis::redis::RedisError;
use mongodb::bson;
use mongodb::error::{Error as MongoError, ErrorKind};
use thiserror::Error;

/// MongoDB 标记的可重试写错误
const RETRYABLE_WRITE_LABEL: &str = "RetryableWriteError";

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    // ==== 前置条件 / 业务错误 ====
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Resource not found")]
    NotFound,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("delete chunk #{chunk} failed: {reason}")]
    DeleteChunk { chunk: usize, reason: String },

    // ==== 系统错误 ====
    #[error("MongoDB error: {0}")]
    Mongo(#[from] MongoError),
    #[error("Redis pool error: {0}")]
    RedisPool(#[from] PoolError),
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("BSON encode error: {0}")]
    BsonSer(#[from] bson::ser::Error),
    #[error("BSON decode error: {0}")]
    BsonDe(#[from] bson::de::Error),
    #[error("Config error: {0}")]
    Config(#[from] ::config::ConfigError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// 是否属于可以退避重试的临时错误（网络抖动、连接池超时等）
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Transient(_) => true,
            AppError::Mongo(e) => {
                e.contains_label(RETRYABLE_WRITE_LABEL)
                    || matches!(
                        *e.kind,
                        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. }
                    )
            }
            AppError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            AppError::RedisPool(e) => matches!(e, PoolError::Timeout(_) | PoolError::Backend(_)),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict(_))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Precondition(format!("参数验证失败: {}", e))
    }
}
