use crate::domain_event::EventPayload;
use crate::error::{DomainError, DomainResult};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 持久化前的领域事件：一条已经发生的事实
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct DomainEvent {
    /// 事件类型标签
    #[builder(into)]
    event_type: String,
    /// 来源聚合类型
    #[builder(into)]
    aggregate_type: String,
    /// 来源聚合 ID
    #[builder(into)]
    aggregate_id: String,
    /// 事件负载（已序列化的事实）
    payload: Value,
    /// 事件发生的墙钟时间
    #[builder(default = Utc::now())]
    occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// 由强类型载荷构建事件；载荷无法序列化时立即失败
    pub fn from_payload<P>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: &P,
    ) -> DomainResult<Self>
    where
        P: EventPayload,
    {
        let event = Self::new(
            aggregate_type,
            aggregate_id,
            payload.event_type(),
            serde_json::to_value(payload)?,
        );
        event.validate()?;
        Ok(event)
    }

    /// 检查事件是否具备完整的来源标识
    pub fn validate(&self) -> DomainResult<()> {
        if self.aggregate_type.trim().is_empty() {
            return Err(DomainError::validation("event is missing aggregate type"));
        }
        if self.aggregate_id.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "event {} of {} is missing aggregate id",
                self.event_type, self.aggregate_type
            )));
        }
        if self.event_type.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "event of {}/{} is missing event type",
                self.aggregate_type, self.aggregate_id
            )));
        }
        Ok(())
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
