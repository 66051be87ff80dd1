//! 持久化（persist）
//!
//! 定义 Outbox 记录与业务状态的持久化形态，以及两侧的存储协议：
//! - 提交侧：`TransactionalStore`/`StoreTransaction`，状态与 Outbox 记录同事务写入；
//! - 投递侧：`OutboxStore`，认领、租约回收与条件状态推进；
//! - 读取侧：`StateReader`，软删除可见性由调用方显式决定。
//!
//! 内置 `InMemoryOutboxStore`；开启 `infra-sqlx` 特性后提供基于 Postgres 的 `PgOutboxStore`。
//!
mod aggregate_state;
mod in_memory;
mod outbox_record;
#[cfg(feature = "infra-sqlx")]
mod postgres;
mod store;

pub use aggregate_state::AggregateState;
pub use in_memory::InMemoryOutboxStore;
pub use outbox_record::{OutboxRecord, OutboxStatus};
#[cfg(feature = "infra-sqlx")]
pub use postgres::PgOutboxStore;
pub use store::{
    ClaimRequest, OutboxStore, StateReader, StatusCounts, StoreTransaction, TransactionalStore,
};

use crate::{aggregate::Aggregate, error::DomainResult};

/// 读取并还原一个聚合；`include_deleted = false` 时软删除的聚合视为不存在
pub async fn load_aggregate<A, R>(
    reader: &R,
    id: &A::Id,
    include_deleted: bool,
) -> DomainResult<Option<A>>
where
    A: Aggregate,
    R: StateReader + ?Sized,
{
    match reader
        .load_state(A::TYPE, &id.to_string(), include_deleted)
        .await?
    {
        Some(state) => Ok(Some(state.to_aggregate()?)),
        None => Ok(None),
    }
}
