//! 事件总线（EventBus）协议
//!
//! 投递器与具体传输之间的边界。下游可以是同一部署内的其他模块，也可以是独立服务，
//! 替换传输实现不影响 Outbox 核心。
//!
//! 发布失败用 `DomainError::is_retryable` 区分：暂时性错误由投递器退避重试，
//! 永久拒绝直接进入死信。
//!
use crate::{domain_event::DeliveryEnvelope, error::DomainResult as Result};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::sync::Arc;

/// 事件总线：负责把投递信封交给下游，并提供订阅流
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: &DeliveryEnvelope) -> Result<()>;

    /// 返回一个 'static 生命周期的信封流，便于在 tokio::spawn 中使用
    async fn subscribe(&self) -> BoxStream<'static, Result<DeliveryEnvelope>>;
}

#[async_trait]
impl<T> EventBus for Arc<T>
where
    T: EventBus + ?Sized,
{
    async fn publish(&self, envelope: &DeliveryEnvelope) -> Result<()> {
        (**self).publish(envelope).await
    }

    async fn subscribe(&self) -> BoxStream<'static, Result<DeliveryEnvelope>> {
        (**self).subscribe().await
    }
}
