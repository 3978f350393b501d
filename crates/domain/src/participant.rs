use serde::{Deserialize, Serialize};

use crate::value_objects::{Timestamp, UserId};

/// 未知用户名的统一占位
pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Member,
    /// 客服会话中的平台客服
    Agent,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Owner => "owner",
            ParticipantRole::Member => "member",
            ParticipantRole::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(ParticipantRole::Owner),
            "member" => Some(ParticipantRole::Member),
            "agent" => Some(ParticipantRole::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    /// 创建时的显示名快照，可能缺失
    pub display_name: Option<String>,
    pub role: ParticipantRole,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub is_archived: bool,
    pub unread_count: u32,
    pub last_read_at: Option<Timestamp>,
}

impl Participant {
    pub fn new(user_id: UserId, display_name: Option<String>, role: ParticipantRole) -> Self {
        Self {
            user_id,
            display_name,
            role,
            is_pinned: false,
            is_muted: false,
            is_archived: false,
            unread_count: 0,
            last_read_at: None,
        }
    }

    /// 他人可见的部分：置顶、免打扰、归档和未读数只属于本人
    pub fn public_view(&self) -> Self {
        Self {
            is_pinned: false,
            is_muted: false,
            is_archived: false,
            unread_count: 0,
            ..self.clone()
        }
    }

    /// 所有读取显示名的地方都走这里，避免各处自行判空
    pub fn display_name_or_default(&self) -> &str {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_DISPLAY_NAME)
    }

    pub fn apply_settings(&mut self, settings: &ParticipantSettings) {
        if let Some(pinned) = settings.is_pinned {
            self.is_pinned = pinned;
        }
        if let Some(muted) = settings.is_muted {
            self.is_muted = muted;
        }
        if let Some(archived) = settings.is_archived {
            self.is_archived = archived;
        }
    }

    pub fn record_read(&mut self, at: Timestamp) {
        self.unread_count = 0;
        self.last_read_at = Some(at);
    }
}

/// 参与者可自行修改的设置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSettings {
    pub is_pinned: Option<bool>,
    pub is_muted: Option<bool>,
    pub is_archived: Option<bool>,
}

impl ParticipantSettings {
    pub fn is_empty(&self) -> bool {
        self.is_pinned.is_none() && self.is_muted.is_none() && self.is_archived.is_none()
    }
}
