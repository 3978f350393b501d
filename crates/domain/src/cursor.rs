//! 不透明分页游标
//!
//! 游标编码 `(时间戳微秒, id)`，保证并发插入时顺序稳定，客户端只能原样回传。

use chrono::{DateTime, Utc};
use data_encoding::BASE64URL_NOPAD;
use uuid::Uuid;

use crate::errors::DomainError;
use crate::value_objects::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub timestamp: Timestamp,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(timestamp: Timestamp, id: impl Into<Uuid>) -> Self {
        Self {
            timestamp,
            id: id.into(),
        }
    }

    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.timestamp.timestamp_micros(), self.id);
        BASE64URL_NOPAD.encode(raw.as_bytes())
    }

    pub fn decode(token: &str) -> Result<Self, DomainError> {
        let invalid = || DomainError::invalid_argument("cursor", "malformed cursor");

        let bytes = BASE64URL_NOPAD
            .decode(token.as_bytes())
            .map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (micros, id) = raw.split_once(':').ok_or_else(invalid)?;
        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let timestamp: DateTime<Utc> = DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?;
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;
        Ok(Self { timestamp, id })
    }

    /// 倒序分页中，`(timestamp, id)` 严格小于游标的记录属于下一页
    pub fn is_after(&self, timestamp: Timestamp, id: Uuid) -> bool {
        (timestamp, id) < (self.timestamp, self.id)
    }
}

/// 把时间戳截断到微秒，与数据库精度一致
pub fn truncate_to_micros(ts: Timestamp) -> Timestamp {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}
