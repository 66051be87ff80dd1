//! 认领/租约协调（ClaimCoordinator）
//!
//! 不依赖任何进程内锁：认领与回收都是存储上的条件更新。
//! - 每个批次使用新的 `ClaimToken`，只有条件更新命中的投递器才拥有该记录；
//! - 投递器崩溃后，其认领在租约到期时自动变为可认领，无需人工介入。
//!
use crate::{
    config::DispatcherConfig,
    error::DomainResult as Result,
    persist::{ClaimRequest, OutboxRecord, OutboxStore},
    value_object::ClaimToken,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// 一次认领的结果：令牌与按 (聚合, 序列号) 排列的记录
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub token: ClaimToken,
    pub records: Vec<OutboxRecord>,
}

impl ClaimedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 按聚合切分，组内保持序列号顺序
    pub fn into_groups(self) -> Vec<Vec<OutboxRecord>> {
        let mut groups: Vec<Vec<OutboxRecord>> = Vec::new();
        for record in self.records {
            match groups.last_mut() {
                Some(group)
                    if group
                        .last()
                        .is_some_and(|prev| prev.aggregate_key() == record.aggregate_key()) =>
                {
                    group.push(record)
                }
                _ => groups.push(vec![record]),
            }
        }
        groups
    }
}

#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn OutboxStore>,
    batch_size: usize,
    lease: chrono::Duration,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn OutboxStore>, config: &DispatcherConfig) -> Result<Self> {
        Ok(Self {
            store,
            batch_size: config.batch_size,
            lease: chrono::Duration::from_std(config.lease_duration())?,
        })
    }

    pub fn request(&self, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest::builder()
            .batch_size(self.batch_size)
            .lease(self.lease)
            .now(now)
            .build()
    }

    /// 以新令牌认领一批记录
    pub async fn claim(&self) -> Result<ClaimedBatch> {
        let request = self.request(Utc::now());
        let records = self.store.claim_batch(&request).await?;
        Ok(ClaimedBatch {
            token: request.token,
            records,
        })
    }

    /// 把租约已过期的认领退回 `Pending`
    pub async fn reclaim_expired(&self) -> Result<u64> {
        let reclaimed = self.store.reclaim_expired_leases(Utc::now()).await?;
        if reclaimed > 0 {
            info!(reclaimed, "expired leases returned to pending");
        }
        Ok(reclaimed)
    }
}
