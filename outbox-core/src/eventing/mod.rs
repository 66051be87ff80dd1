//! 投递子系统（eventing）
//!
//! 把已提交的 Outbox 记录可靠地交给下游：
//! - `EventBus`：传输抽象（消息中间件、HTTP 回调或进程内处理器）；
//! - `ClaimCoordinator`：以租约认领记录，保证同一记录同一时刻只有一个持有者；
//! - `Dispatcher`：按聚合顺序投递，失败退避重试，耗尽后进入死信；
//! - `HandlerBus`/`EventHandler`：进程内消费，`IdempotentHandler` 以消息 ID 去重；
//! - `OutboxAdmin`：死信重新入队、统计与清理。
//!
pub mod admin;
pub mod bus;
pub mod bus_inmemory;
pub mod claim;
pub mod dead_letter;
pub mod dispatcher;
pub mod handler;
pub mod idempotent;

pub use admin::OutboxAdmin;
pub use bus::EventBus;
pub use bus_inmemory::InMemoryEventBus;
pub use claim::{ClaimCoordinator, ClaimedBatch};
pub use dead_letter::{CollectingDeadLetterSink, DeadLetterSink, TracingDeadLetterSink};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherHandle};
pub use handler::{EventHandler, HandledEventType, HandlerBus, HandlerRegistry};
pub use idempotent::{IdempotentHandler, InMemoryProcessedMessages, ProcessedMessageStore};
