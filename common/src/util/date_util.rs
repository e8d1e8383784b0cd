use chrono::{DateTime, Utc};

/// 当前 Unix 秒时间戳（UTC）
pub fn now() -> i64 {
    Utc::now().timestamp()
}

pub fn time_to_str(time: i64) -> String {
    match DateTime::from_timestamp(time, 0) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::new(),
    }
}
