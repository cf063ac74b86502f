use crate::value_objects::{DisplayName, UserId};

/// 用户身份记录。
///
/// 在线标志是在线状态跟踪器的属性，从连接数派生，
/// 不冗余存储在身份记录上，避免两处状态漂移。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: DisplayName,
}

impl UserProfile {
    pub fn new(id: UserId, display_name: DisplayName) -> Self {
        Self { id, display_name }
    }
}
