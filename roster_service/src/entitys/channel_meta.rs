use common::ChannelId;
use serde::{Deserialize, Serialize};

/// 频道级元数据，文档 ID 为 `channel:<channel_id>:meta`，与成员同分片
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelMeta {
    pub channel_id: ChannelId,
    /// 版本号，只能通过原子自增或显式设置改变
    pub version: i64,
    /// 最后更新时间（Unix 秒时间戳）
    pub updated_at: i64,
}

impl ChannelMeta {
    /// 不存在时返回的零版本记录
    pub fn empty(channel_id: ChannelId) -> Self {
        Self { channel_id, version: 0, updated_at: 0 }
    }
}

/// 写操作附带的版本处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionUpdate {
    /// 原子自增（不存在则初始化为 1）
    Auto,
    /// 不动版本
    Skip,
    /// 直接设置为指定值
    Exact(i64),
}

/// 兼容旧的整数约定：负数自增，0 跳过，正数精确设置
impl From<i64> for VersionUpdate {
    fn from(v: i64) -> Self {
        match v {
            v if v < 0 => VersionUpdate::Auto,
            0 => VersionUpdate::Skip,
            v => VersionUpdate::Exact(v),
        }
    }
}

/// 下推到存储层的 meta 条件更新
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaUpdate {
    /// 不存在则 version=1，否则 version+1（服务端原子执行）
    Increment { updated_at: i64 },
    /// 整条覆盖
    Set { version: i64, updated_at: i64 },
}
