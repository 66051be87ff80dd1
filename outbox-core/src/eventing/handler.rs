//! 事件处理器（EventHandler）与进程内传输（HandlerBus）
//!
//! 当下游消费方就在同一部署内时，`HandlerBus` 直接充当传输：
//! 按事件类型把信封路由给已注册的处理器，并发执行。
//! 任一处理器失败即视为本次发布失败，由投递器重试；未失败的处理器会再次收到信封，
//! 需要去重的处理器可用 `IdempotentHandler` 包装。
//!
use crate::{
    domain_event::DeliveryEnvelope,
    error::{DomainError, DomainResult as Result},
    eventing::EventBus,
};
use async_trait::async_trait;
use bon::Builder;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, stream};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::handler_bus_builder::{IsUnset, SetRegistry, State as BuilderState};

#[derive(Clone, Debug)]
pub enum HandledEventType {
    One(String),
    Many(Vec<String>),
    All,
}

/// 事件处理器：处理某一类型的事件
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于失败日志与去重键）
    fn handler_name(&self) -> &str;
    /// 返回该处理器支持的事件类型
    fn handled_event_type(&self) -> HandledEventType;
    /// 处理事件
    async fn handle(&self, envelope: &DeliveryEnvelope) -> Result<()>;
}

/// 按事件类型索引的处理器集合
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_type: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    all: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        let mut by_type: HashMap<String, Vec<Arc<dyn EventHandler>>> = HashMap::new();
        let mut all: Vec<Arc<dyn EventHandler>> = Vec::new();

        for h in handlers {
            match h.handled_event_type() {
                HandledEventType::All => all.push(h),
                HandledEventType::One(t) => {
                    by_type.entry(t).or_default().push(h);
                }
                HandledEventType::Many(ts) => {
                    for t in ts {
                        by_type.entry(t).or_default().push(h.clone());
                    }
                }
            }
        }

        Self { by_type, all }
    }

    pub fn matching(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut merged: Vec<Arc<dyn EventHandler>> = Vec::new();
        if let Some(list) = self.by_type.get(event_type) {
            merged.extend(list.iter().cloned());
        }
        merged.extend(self.all.iter().cloned());
        merged
    }
}

/// 进程内传输：把信封分发给匹配的处理器
#[derive(Clone, Builder)]
pub struct HandlerBus {
    #[builder(setters(vis = "pub(crate)"))]
    registry: HandlerRegistry,
    /// 单个信封的处理并发（同一信封广播给多个 handler）
    #[builder(default = 8)]
    handler_concurrency: usize,
    /// 处理成功的信封会转发到订阅流
    #[builder(skip = broadcast::channel(1024).0)]
    tap: broadcast::Sender<DeliveryEnvelope>,
}

impl<S: BuilderState> HandlerBusBuilder<S> {
    pub fn event_handlers(
        self,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> HandlerBusBuilder<SetRegistry<S>>
    where
        <S as BuilderState>::Registry: IsUnset,
    {
        self.registry(HandlerRegistry::new(handlers))
    }
}

impl HandlerBus {
    /// 把处理器错误归一为发布错误：不可重试的错误升级为永久拒绝
    fn classify(handler: &str, envelope: &DeliveryEnvelope, err: DomainError) -> DomainError {
        match err {
            err @ DomainError::Publish { .. } => err,
            err if !err.is_retryable() => {
                DomainError::permanent_publish(envelope.message_id, format!("{handler}: {err}"))
            }
            err => DomainError::EventHandler {
                handler: handler.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

#[async_trait]
impl EventBus for HandlerBus {
    async fn publish(&self, envelope: &DeliveryEnvelope) -> Result<()> {
        let handlers = self.registry.matching(&envelope.event_type);
        if handlers.is_empty() {
            return Ok(());
        }

        let mut failures: Vec<DomainError> = stream::iter(handlers)
            .map(|h| async move {
                h.handle(envelope).await.map_err(|err| {
                    warn!(
                        handler = h.handler_name(),
                        message_id = %envelope.message_id,
                        error = %err,
                        "event handler failed"
                    );
                    Self::classify(h.handler_name(), envelope, err)
                })
            })
            .buffer_unordered(self.handler_concurrency.max(1))
            .boxed()
            .filter_map(|r| async move { r.err() })
            .collect()
            .await;

        if failures.is_empty() {
            let _ = self.tap.send(envelope.clone());
            return Ok(());
        }

        // 有永久拒绝时优先上报
        let idx = failures
            .iter()
            .position(|e| !e.is_retryable())
            .unwrap_or(0);
        Err(failures.swap_remove(idx))
    }

    async fn subscribe(&self) -> BoxStream<'static, Result<DeliveryEnvelope>> {
        let rx = self.tap.subscribe();
        Box::pin(
            BroadcastStream::new(rx).map(|r| r.map_err(|e| DomainError::event_bus(e.to_string()))),
        )
    }
}
