//! Outbox 持久化模型（OutboxRecord）
//!
//! 投递的基本单位。记录由提交管道在与状态变更相同的事务内创建为 `Pending`，
//! 此后只通过以 `status`/`claim_token` 为条件的更新推进生命周期：
//!
//! ```text
//! Pending ──claim──▶ Claimed ──ok──▶ Dispatched
//!    ▲                 │
//!    └── lease 过期 ───┤
//! Failed ◀── 暂时失败 ─┤
//!                      └── 次数耗尽/永久拒绝 ──▶ DeadLettered
//! ```
//!
use crate::{
    domain_event::DomainEvent,
    error::{DomainError, DomainResult},
    value_object::{ClaimToken, MessageId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Outbox 记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// 已提交，等待认领
    Pending,
    /// 已被某个投递器在租约内认领
    Claimed,
    /// 投递成功（终态）
    Dispatched,
    /// 上次投递失败，等待退避结束后重新认领
    Failed,
    /// 重试耗尽或被永久拒绝（终态，不会自动回收）
    DeadLettered,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        OutboxStatus::Pending,
        OutboxStatus::Claimed,
        OutboxStatus::Dispatched,
        OutboxStatus::Failed,
        OutboxStatus::DeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Claimed => "claimed",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Dispatched | OutboxStatus::DeadLettered)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutboxStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::Parse {
                reason: format!("unknown outbox status: {s}"),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// 全局唯一消息 ID，下游去重键
    pub(crate) message_id: MessageId,
    /// 事实来源：聚合类型
    pub(crate) aggregate_type: String,
    /// 事实来源：聚合 ID
    pub(crate) aggregate_id: String,
    /// 每个聚合内严格递增、无空洞的序列号，决定投递顺序
    pub(crate) sequence_number: u64,
    /// 事件类型
    pub(crate) event_type: String,
    /// 已序列化的事实
    pub(crate) payload: Value,
    /// 来源事务提交的时间
    pub(crate) occurred_at: DateTime<Utc>,
    pub(crate) status: OutboxStatus,
    /// 已失败的投递次数
    pub(crate) attempts: u32,
    pub(crate) last_error: Option<String>,
    /// 当前持有者的认领令牌（未认领时为空）
    pub(crate) claim_token: Option<ClaimToken>,
    /// 租约到期时间（未认领时为空）
    pub(crate) lease_expires_at: Option<DateTime<Utc>>,
    /// 退避结束前不可认领
    pub(crate) available_at: DateTime<Utc>,
    pub(crate) dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// 由领域事件创建一条新的 `Pending` 记录
    pub fn pending(
        event: &DomainEvent,
        sequence_number: u64,
        committed_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        event.validate()?;
        if sequence_number == 0 {
            return Err(DomainError::validation("sequence numbers start at 1"));
        }

        Ok(Self {
            message_id: MessageId::new(),
            aggregate_type: event.aggregate_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            sequence_number,
            event_type: event.event_type().to_string(),
            payload: event.payload().clone(),
            occurred_at: committed_at,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            claim_token: None,
            lease_expires_at: None,
            available_at: committed_at,
            dispatched_at: None,
        })
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn claim_token(&self) -> Option<ClaimToken> {
        self.claim_token
    }

    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lease_expires_at
    }

    pub fn available_at(&self) -> DateTime<Utc> {
        self.available_at
    }

    pub fn dispatched_at(&self) -> Option<DateTime<Utc>> {
        self.dispatched_at
    }

    /// 聚合分组键
    pub fn aggregate_key(&self) -> (&str, &str) {
        (&self.aggregate_type, &self.aggregate_id)
    }

    /// 是否可被 `now` 时刻的认领看到（不含同聚合前序记录的约束）
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending | OutboxStatus::Failed => {
                self.claim_token.is_none() && self.available_at <= now
            }
            OutboxStatus::Claimed => self.lease_expires_at.is_some_and(|at| at < now),
            OutboxStatus::Dispatched | OutboxStatus::DeadLettered => false,
        }
    }

    /// 是否由 `token` 在 `Claimed` 状态下持有
    pub fn is_held_by(&self, token: ClaimToken) -> bool {
        self.status == OutboxStatus::Claimed && self.claim_token == Some(token)
    }
}
