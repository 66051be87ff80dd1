//! 事务性 Outbox 与领域事件投递（outbox-core）
//!
//! 解决"写库成功但消息未发出 / 消息发出但写库回滚"的双写问题：
//! - 聚合（`aggregate`）在内存中记录领域事件（`domain_event`）；
//! - 工作单元（`unit_of_work`）在同一原子事务中写入业务状态与 Outbox 记录，
//!   并为每个聚合分配严格递增、无空洞的序列号；
//! - 投递子系统（`eventing`）以租约认领记录，按聚合顺序至少一次地交给下游，
//!   失败按指数退避重试，耗尽后进入死信；
//! - 存储协议与实现（`persist`）：内存实现用于测试，Postgres 实现基于 sqlx。
//!
//! 典型用法：
//! 1. 用 `#[aggregate_root]` 与 `#[domain_event]` 定义聚合与事件；
//! 2. 在业务方法中通过 `record_event` 记录事件；
//! 3. 用 `CommitPipeline::unit_of_work` 登记聚合并提交；
//! 4. 启动 `Dispatcher`，连接具体的 `EventBus`。
//!
pub mod aggregate;
pub mod config;
pub mod domain_event;
pub mod entity;
pub mod error;
#[cfg(feature = "eventing")]
pub mod eventing;
pub mod persist;
pub mod unit_of_work;
pub mod value_object;

pub use outbox_macros::{aggregate_root, domain_event, entity_id};

// 允许在本 crate 内部通过 ::outbox_core 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::outbox_core 路径。
extern crate self as outbox_core;
