use anyhow::{Context, Result};
use common::ChannelId;
use common::config::AppConfig;
use common::db::{connect_mongo, ping_mongo};
use common::errors::AppError;
use common::redis::redis_pool::{build_redis_pool, ping_redis};
use common::util::date_util::time_to_str;
use log::{LevelFilter, info, warn};
use roster_service::manager::query_paginator::Window;
use roster_service::manager::roster_manager::{RosterManager, RosterManagerOpt};
use serde::Serialize;
use std::str::FromStr;

const DEFAULT_CONFIG: &str = "./app_roster/roster-config.toml";

/// 单个频道的巡检结果
#[derive(Debug, Serialize)]
struct ChannelSummary {
    channel_id: ChannelId,
    shard: String,
    version: i64,
    updated_at: String,
    /// 未缓存时为 None
    cached_members: Option<usize>,
    elevated_total: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 读取配置文件，ROSTER_CONFIG 可指定其它路径
    let config_file = std::env::var("ROSTER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let app_cfg = AppConfig::new(&config_file).with_context(|| format!("load config {}", config_file))?;
    //初始化日志
    init_log(&app_cfg)?;

    let channels = std::env::args()
        .skip(1)
        .map(|arg| arg.parse::<ChannelId>().with_context(|| format!("invalid channel id {:?}", arg)))
        .collect::<Result<Vec<_>>>()?;
    if channels.is_empty() {
        warn!("usage: app_roster <channel_id> [channel_id ...]");
        return Ok(());
    }

    let (client, db) = connect_mongo(&app_cfg.get_database()).await?;
    ping_mongo(&db).await?;
    let pool = build_redis_pool(&app_cfg.get_redis().url)?;
    ping_redis(&pool).await?;
    info!("connected to {} and redis", app_cfg.get_database().db_name);

    let manager = RosterManager::with_mongo_redis(client, db, pool, app_cfg.get_roster())?;
    for channel_id in channels {
        match inspect(&manager, channel_id).await {
            Ok(summary) => println!("{}", serde_json::to_string(&summary)?),
            Err(e) => warn!("⚠️ channel {}: {:#}", channel_id, e),
        }
    }
    Ok(())
}

async fn inspect(manager: &RosterManager, channel_id: ChannelId) -> Result<ChannelSummary> {
    let shard = manager.router().require_shard(channel_id)?;
    let meta = manager.get_version(channel_id).await?;
    let cached = manager.cached_members(channel_id).await?;
    // limit = 0 只取总数
    let admins = manager.query_admins(channel_id, Window::new(0, 0)).await?;
    Ok(ChannelSummary {
        channel_id,
        shard,
        version: meta.version,
        updated_at: time_to_str(meta.updated_at),
        cached_members: cached.map(|m| m.len()),
        elevated_total: admins.total,
    })
}

pub fn init_log(config: &AppConfig) -> Result<(), AppError> {
    let mut builder = env_logger::Builder::new();
    let log_level = &config.get_sys().log_leve;
    let level = LevelFilter::from_str(log_level).map_err(|e| AppError::Precondition(format!("invalid log level {}: {}", log_level, e)))?;
    builder.filter(None, level).init();
    Ok(())
}
