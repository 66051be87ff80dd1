//! 运维操作（OutboxAdmin）
//!
//! 死信检查与人工重新入队、状态统计、清理已投递记录。
//!
use crate::{
    error::{DomainError, DomainResult as Result},
    persist::{OutboxRecord, OutboxStatus, OutboxStore, StatusCounts},
    value_object::MessageId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct OutboxAdmin {
    store: Arc<dyn OutboxStore>,
}

impl OutboxAdmin {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        self.store.list_dead_lettered(limit).await
    }

    /// 把一条死信退回 `Pending`，尝试次数清零
    pub async fn requeue(&self, message_id: MessageId) -> Result<()> {
        let Some(record) = self.store.get(message_id).await? else {
            return Err(DomainError::NotFound {
                reason: format!("outbox record {message_id}"),
            });
        };

        if record.status() != OutboxStatus::DeadLettered {
            return Err(DomainError::InvalidState {
                reason: format!(
                    "only dead-lettered records can be requeued, {message_id} is {}",
                    record.status()
                ),
            });
        }

        // 检查与更新之间被他人重新入队
        if !self.store.requeue_dead_lettered(message_id, Utc::now()).await? {
            return Err(DomainError::Conflict {
                reason: format!("{message_id} changed while requeueing"),
            });
        }

        info!(%message_id, "dead-lettered record requeued");
        Ok(())
    }

    pub async fn stats(&self) -> Result<StatusCounts> {
        self.store.status_counts().await
    }

    pub async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let purged = self.store.purge_dispatched(older_than).await?;
        if purged > 0 {
            info!(purged, "dispatched records purged");
        }
        Ok(purged)
    }
}
