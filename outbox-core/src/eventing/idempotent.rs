//! 消费侧去重（IdempotentHandler）
//!
//! 投递是至少一次的，消费方以 `message_id` 去重。包装任意 `EventHandler`：
//! 处理前查询是否已处理；处理成功后才登记，失败不登记以便下次重投时重试。
//!
use crate::{
    domain_event::DeliveryEnvelope,
    error::DomainResult as Result,
    eventing::{EventHandler, HandledEventType},
    value_object::MessageId,
};
use async_trait::async_trait;
use std::{collections::HashSet, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;

/// 已处理消息的登记表，按 (消息, 处理器) 记录
#[async_trait]
pub trait ProcessedMessageStore: Send + Sync {
    async fn contains(&self, message_id: MessageId, handler_name: &str) -> Result<bool>;

    async fn mark_processed(&self, message_id: MessageId, handler_name: &str) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct InMemoryProcessedMessages {
    processed: Arc<RwLock<HashSet<(MessageId, String)>>>,
}

impl InMemoryProcessedMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.processed.read().await.len()
    }
}

#[async_trait]
impl ProcessedMessageStore for InMemoryProcessedMessages {
    async fn contains(&self, message_id: MessageId, handler_name: &str) -> Result<bool> {
        let key = (message_id, handler_name.to_string());
        Ok(self.processed.read().await.contains(&key))
    }

    async fn mark_processed(&self, message_id: MessageId, handler_name: &str) -> Result<()> {
        self.processed
            .write()
            .await
            .insert((message_id, handler_name.to_string()));
        Ok(())
    }
}

pub struct IdempotentHandler<H> {
    inner: H,
    processed: Arc<dyn ProcessedMessageStore>,
}

impl<H: EventHandler> IdempotentHandler<H> {
    pub fn new(inner: H, processed: Arc<dyn ProcessedMessageStore>) -> Self {
        Self { inner, processed }
    }
}

#[async_trait]
impl<H: EventHandler + 'static> EventHandler for IdempotentHandler<H> {
    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    fn handled_event_type(&self) -> HandledEventType {
        self.inner.handled_event_type()
    }

    async fn handle(&self, envelope: &DeliveryEnvelope) -> Result<()> {
        let name = self.inner.handler_name();
        let key = envelope.dedup_key();

        if self.processed.contains(key, name).await? {
            debug!(handler = name, message_id = %key, "skipping duplicate delivery");
            return Ok(());
        }

        self.inner.handle(envelope).await?;
        self.processed.mark_processed(key, name).await
    }
}
