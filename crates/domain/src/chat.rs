//! 会话引用。
//!
//! 私聊与群聊共用同一个引用类型。私聊键由两个参与者标识排序后组合，
//! 与参与者给出的顺序无关，因此每个无序对至多对应一条私聊。

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{GroupId, UserId};

/// 私聊的确定性键：两个参与者标识按序组合。
///
/// 构造时排序，序列化往返后仍保持 `lo <= hi` 不变式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PairKey {
    lo: UserId,
    hi: UserId,
}

impl PairKey {
    /// 由两个参与者构造，顺序无关。两个标识相同视为非法。
    pub fn of(a: UserId, b: UserId) -> Result<Self, DomainError> {
        if a == b {
            return Err(DomainError::invalid_argument(
                "pair_key",
                "participants must be distinct",
            ));
        }
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self { lo, hi })
    }

    pub fn lo(&self) -> UserId {
        self.lo
    }

    pub fn hi(&self) -> UserId {
        self.hi
    }

    /// 恰好两个参与者。
    pub fn participants(&self) -> [UserId; 2] {
        [self.lo, self.hi]
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.lo == user_id || self.hi == user_id
    }

    /// 给定一方，返回另一方。
    pub fn other(&self, user_id: UserId) -> Option<UserId> {
        if self.lo == user_id {
            Some(self.hi)
        } else if self.hi == user_id {
            Some(self.lo)
        } else {
            None
        }
    }
}

impl<'de> Deserialize<'de> for PairKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            lo: UserId,
            hi: UserId,
        }

        // 经过构造函数以恢复排序不变式，不信任输入顺序
        let raw = Raw::deserialize(deserializer)?;
        PairKey::of(raw.lo, raw.hi).map_err(D::Error::custom)
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lo, self.hi)
    }
}

/// 会话引用：私聊或群聊。
///
/// 参与者集合在发送时惰性解析，永远不缓存在消息上。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "chat_type", rename_all = "snake_case")]
pub enum ChatRef {
    Private { pair: PairKey },
    Group { group_id: GroupId },
}

impl ChatRef {
    pub fn private(a: UserId, b: UserId) -> Result<Self, DomainError> {
        Ok(Self::Private {
            pair: PairKey::of(a, b)?,
        })
    }

    pub fn group(group_id: GroupId) -> Self {
        Self::Group { group_id }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private { .. })
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private { pair } => write!(f, "private:{}", pair),
            Self::Group { group_id } => write!(f, "group:{}", group_id),
        }
    }
}
