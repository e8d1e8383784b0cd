use crate::errors::AppError;
use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub database: Option<DatabaseConfig>,
    pub redis: Option<RedisConfig>,
    pub sys: Option<SysConfig>,
    pub roster: Option<RosterConfig>,
}

impl AppConfig {
    /// 从配置文件加载，`APP__` 前缀的环境变量可覆盖（如 `APP__ROSTER__SHARD_COUNT`）
    pub fn new(file: &str) -> Result<Self, AppError> {
        let config = Config::builder()
            .add_source(File::with_name(file).required(true))
            .add_source(Environment::with_prefix("APP").prefix_separator("__").separator("__").try_parsing(true))
            .build()?;
        Self::finish(config)
    }

    /// 直接从 TOML 文本加载（测试 / 内嵌配置）
    pub fn from_toml(content: &str) -> Result<Self, AppError> {
        let config = Config::builder().add_source(File::from_str(content, FileFormat::Toml)).build()?;
        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self, AppError> {
        let cfg = config.try_deserialize::<AppConfig>()?;
        cfg.get_roster().validate()?;
        Ok(cfg)
    }

    pub fn get_database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }
    pub fn get_redis(&self) -> RedisConfig {
        self.redis.clone().unwrap_or_default()
    }
    pub fn get_sys(&self) -> SysConfig {
        self.sys.clone().unwrap_or_default()
    }
    pub fn get_roster(&self) -> RosterConfig {
        self.roster.clone().unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    pub url: String,
    pub db_name: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SysConfig {
    //全局日志级别
    pub log_leve: String,
}

impl Default for SysConfig {
    fn default() -> Self {
        Self { log_leve: "info".to_string() }
    }
}

/// 成员名册同步参数
#[derive(Debug, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct RosterConfig {
    /// 分片数 N：shard = channel_id % N
    #[validate(range(min = 1, max = 1000))]
    pub shard_count: i64,
    /// 按 user_id 批量删除时每块的 id 数
    #[validate(range(min = 1, max = 10000))]
    pub delete_chunk_size: usize,
    /// offset + limit 不超过该值时走普通分页，否则走游标扫描
    #[validate(range(min = 1))]
    pub page_window_max: u64,
    /// 游标扫描每批拉取条数
    #[validate(range(min = 1))]
    pub scan_batch: u32,
    /// 游标存活时间（秒）
    pub scan_keep_alive_secs: u64,
    /// meta 原子自增冲突时的最大尝试次数
    #[validate(range(min = 1))]
    pub meta_retry_on_conflict: u32,
    /// 单次 meta 操作超时（毫秒）
    #[validate(range(min = 1))]
    pub meta_timeout_ms: u64,
    #[validate(nested)]
    pub bulk: BulkConfig,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            shard_count: 1000,
            delete_chunk_size: 1000,
            page_window_max: 10_000,
            scan_batch: 2000,
            scan_keep_alive_secs: 60,
            meta_retry_on_conflict: 3,
            meta_timeout_ms: 5000,
            bulk: BulkConfig::default(),
        }
    }
}

/// 批量写入器参数
#[derive(Debug, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct BulkConfig {
    /// 并行发送批次的 worker 数
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,
    /// 单批最大条数
    #[validate(range(min = 1))]
    pub bulk_actions: usize,
    /// 单批最大字节数
    #[validate(range(min = 1))]
    pub bulk_size_bytes: usize,
    /// 空闲自动 flush 间隔（毫秒）
    #[validate(range(min = 1))]
    pub flush_interval_ms: u64,
    /// 待写入队列容量，满了 add 会挂起
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_retries: u32,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            bulk_actions: 4000,
            bulk_size_bytes: 15 << 20,
            flush_interval_ms: 1000,
            queue_capacity: 4000,
            backoff_initial_ms: 200,
            backoff_max_ms: 1000,
            max_retries: 5,
        }
    }
}
