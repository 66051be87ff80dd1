//! 领域事件（Domain Event）
//!
//! - `EventPayload`：事件载荷需要实现的最小接口（通常由 `#[domain_event]` 生成）；
//! - `DomainEvent`：持久化前的内存事件，只存活到提交管道把它转换为 Outbox 记录；
//! - `EventRecorder`：业务状态根内部的有序事件缓冲；
//! - `DeliveryEnvelope`：投递器交给传输层的下游信封。

mod delivery_envelope;
mod event;
mod event_payload;
mod recorder;

pub use delivery_envelope::DeliveryEnvelope;
pub use event::DomainEvent;
pub use event_payload::EventPayload;
pub use recorder::EventRecorder;
