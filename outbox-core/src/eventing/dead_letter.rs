//! 死信出口（DeadLetterSink）
//!
//! 记录进入 `DeadLettered` 后交给死信出口，供运维检查。
//! 死信本身已经落在 Outbox 表中，出口只负责"浮出水面"（告警、日志、转存）。
//!
use crate::{error::DomainResult as Result, persist::OutboxRecord};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::error;

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_lettered(&self, record: &OutboxRecord) -> Result<()>;
}

/// 以 error 级别日志上报
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for TracingDeadLetterSink {
    async fn dead_lettered(&self, record: &OutboxRecord) -> Result<()> {
        error!(
            message_id = %record.message_id(),
            aggregate_type = record.aggregate_type(),
            aggregate_id = record.aggregate_id(),
            sequence_number = record.sequence_number(),
            event_type = record.event_type(),
            attempts = record.attempts(),
            last_error = record.last_error().unwrap_or_default(),
            "outbox record dead-lettered"
        );
        Ok(())
    }
}

/// 收集死信记录，便于测试与检查
#[derive(Clone, Default)]
pub struct CollectingDeadLetterSink {
    records: Arc<Mutex<Vec<OutboxRecord>>>,
}

impl CollectingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OutboxRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for CollectingDeadLetterSink {
    async fn dead_lettered(&self, record: &OutboxRecord) -> Result<()> {
        match self.records.lock() {
            Ok(mut guard) => guard.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }
}
