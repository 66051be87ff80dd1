use crate::persist::OutboxRecord;
use crate::value_object::MessageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 下游投递信封：投递器交给传输层的内容
///
/// 消费方以 `message_id`（或 `aggregate_id + sequence_number`）作为去重键。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub message_id: MessageId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
    pub sequence_number: u64,
}

impl DeliveryEnvelope {
    pub fn dedup_key(&self) -> MessageId {
        self.message_id
    }
}

impl From<&OutboxRecord> for DeliveryEnvelope {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            message_id: record.message_id(),
            aggregate_type: record.aggregate_type().to_string(),
            aggregate_id: record.aggregate_id().to_string(),
            event_type: record.event_type().to_string(),
            payload: record.payload().clone(),
            occurred_at: record.occurred_at(),
            sequence_number: record.sequence_number(),
        }
    }
}
