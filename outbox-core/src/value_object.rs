//! 值对象（Value Object）
//!
//! Outbox 中以值相等为准的标识：消息 ID 与认领令牌。
//!
use outbox_macros::entity_id;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息全局唯一标识，创建时分配，下游据此去重
#[entity_id]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// 认领令牌：一次 claim 批次的所有权标记
///
/// 每次认领都生成新的令牌，条件更新以它为准，过期租约按旧令牌回收而非盲目覆盖。
#[entity_id]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_display_and_parse() {
        let id = MessageId::new();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<MessageId>().is_err());
    }

    #[test]
    fn claim_tokens_are_fresh() {
        assert_ne!(ClaimToken::new(), ClaimToken::new());
        let raw = Uuid::new_v4();
        assert_eq!(ClaimToken::from(raw).as_uuid(), raw);
    }
}
