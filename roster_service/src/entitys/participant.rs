use common::{ChannelId, UserId};
use serde::{Deserialize, Serialize};

/// 频道成员记录，文档 ID 为 `channel:<channel_id>:<user_id>`
///
/// 所有字段缺省时取默认值，便于部分字段 upsert；字段类型不符则视为损坏文档
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ParticipantRecord {
    pub channel_id: ChannelId,             // 频道 ID（分片键）
    pub user_id: UserId,                   // 用户 ID（频道内唯一）
    pub is_creator: i32,                   // 是否创建者 0/1
    pub admin_rights: i32,                 // 管理员权限位，>0 即管理员
    pub participant_type: i32,             // 成员类型
    pub hidden_participant: i32,           // 是否隐藏成员 0/1
    pub is_left: i32,                      // 是否已退出 0/1
    pub left_at: i64,                      // 退出时间
    pub is_kicked: i32,                    // 是否被踢 0/1
    pub kicked_by: UserId,                 // 操作人
    pub kicked_at: i64,                    // 被踢时间
    pub banned_rights: i32,                // 禁言/封禁权限位
    pub banned_until: i64,                 // 封禁截止时间
    pub banned_at: i64,
    pub inviter_user_id: UserId,
    pub invited_at: i64,
    pub joined_at: i64,
    pub promoted_by: UserId,
    pub promoted_at: i64,
    pub rank: String,                      // 自定义头衔
    pub read_inbox_max_id: i64,
    pub read_outbox_max_id: i64,
    pub state: i32,
    /// 创建时间（Unix 秒时间戳）
    pub created_at: i64,
    /// 最后更新时间（Unix 秒时间戳）
    pub updated_at: i64,
}

impl ParticipantRecord {
    pub fn new(channel_id: ChannelId, user_id: UserId) -> Self {
        Self { channel_id, user_id, ..Default::default() }
    }

    /// 活跃、可见且具备管理身份（创建者或管理员）
    pub fn is_active_elevated(&self) -> bool {
        self.is_left == 0
            && self.is_kicked == 0
            && self.hidden_participant == 0
            && (self.is_creator == 1 || self.admin_rights > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{self, doc};

    #[test]
    fn partial_document_fills_defaults() {
        let rec: ParticipantRecord = bson::from_document(doc! { "channel_id": 7i32, "user_id": 42i64, "is_creator": 1 }).unwrap();
        assert_eq!(rec.channel_id, 7);
        assert_eq!(rec.user_id, 42);
        assert!(rec.is_active_elevated());
        assert_eq!(rec.rank, "");
    }

    #[test]
    fn wrong_field_type_is_malformed() {
        let out = bson::from_document::<ParticipantRecord>(doc! { "channel_id": 7i64, "user_id": 1i64, "rank": 5i32 });
        assert!(out.is_err());
    }

    #[test]
    fn left_admin_is_not_elevated() {
        let rec = ParticipantRecord { admin_rights: 3, is_left: 1, ..ParticipantRecord::new(1, 2) };
        assert!(!rec.is_active_elevated());
    }
}
