//! 内存版 Outbox 存储（InMemoryOutboxStore）
//!
//! 以 `tokio::sync::Mutex` 保护的表实现全部存储协议：
//! - 事务持有表的独占锁并暂存写入，只在 `commit` 时落到表上，丢弃即回滚；
//! - 认领/标记在同一把锁下完成，条件更新语义与 Postgres 实现一致；
//! - 典型用途：测试环境、示例与本地开发。
//!
use crate::{
    error::{DomainError, DomainResult as Result},
    persist::{
        AggregateState, ClaimRequest, OutboxRecord, OutboxStatus, OutboxStore, StateReader,
        StatusCounts, StoreTransaction, TransactionalStore,
    },
    value_object::{ClaimToken, MessageId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex, OwnedMutexGuard};

type AggregateKey = (String, String);
type RecordKey = (String, String, u64);

#[derive(Default)]
struct Tables {
    /// 按 (聚合类型, 聚合 ID, 序列号) 有序
    outbox: BTreeMap<RecordKey, OutboxRecord>,
    by_message_id: HashMap<MessageId, RecordKey>,
    sequences: HashMap<AggregateKey, u64>,
    states: HashMap<AggregateKey, AggregateState>,
}

impl Tables {
    fn find_mut(&mut self, message_id: MessageId) -> Option<&mut OutboxRecord> {
        let key = self.by_message_id.get(&message_id)?;
        self.outbox.get_mut(key)
    }

    /// 对令牌持有的记录执行更新；令牌不匹配时不做任何事
    fn update_held(
        &mut self,
        message_id: MessageId,
        token: ClaimToken,
        update: impl FnOnce(&mut OutboxRecord),
    ) -> bool {
        match self.find_mut(message_id) {
            Some(record) if record.is_held_by(token) => {
                update(record);
                record.claim_token = None;
                record.lease_expires_at = None;
                true
            }
            _ => false,
        }
    }
}

/// 内存版存储；克隆共享同一组表
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    tables: Arc<Mutex<Tables>>,
    fail_on_commit: Arc<AtomicBool>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 故障注入：开启后所有事务在提交时失败（模拟存储不可用）
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// 全部 Outbox 记录的有序快照
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.tables.lock().await.outbox.values().cloned().collect()
    }

    /// 某个聚合的 Outbox 记录（按序列号）
    pub async fn records_for(&self, aggregate_type: &str, aggregate_id: &str) -> Vec<OutboxRecord> {
        self.tables
            .lock()
            .await
            .outbox
            .values()
            .filter(|r| r.aggregate_key() == (aggregate_type, aggregate_id))
            .cloned()
            .collect()
    }
}

struct InMemoryTransaction {
    tables: OwnedMutexGuard<Tables>,
    fail_on_commit: bool,
    states: Vec<AggregateState>,
    sequences: HashMap<AggregateKey, u64>,
    records: Vec<OutboxRecord>,
}

#[async_trait]
impl TransactionalStore for InMemoryOutboxStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tables = self.tables.clone().lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            tables,
            fail_on_commit: self.fail_on_commit.load(Ordering::SeqCst),
            states: Vec::new(),
            sequences: HashMap::new(),
            records: Vec::new(),
        }))
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn save_state(&mut self, state: &AggregateState) -> Result<()> {
        self.states.push(state.clone());
        Ok(())
    }

    async fn allocate_sequences(
        &mut self,
        aggregate_type: &str,
        aggregate_id: &str,
        count: u64,
    ) -> Result<u64> {
        if count == 0 {
            return Err(DomainError::validation("cannot allocate zero sequence numbers"));
        }

        let key = (aggregate_type.to_string(), aggregate_id.to_string());
        let current = match self.sequences.get(&key) {
            Some(staged) => *staged,
            None => self.tables.sequences.get(&key).copied().unwrap_or(0),
        };
        self.sequences.insert(key, current + count);
        Ok(current + 1)
    }

    async fn insert_outbox(&mut self, records: &[OutboxRecord]) -> Result<()> {
        for record in records {
            let key = (
                record.aggregate_type.clone(),
                record.aggregate_id.clone(),
                record.sequence_number,
            );
            let duplicate_seq = self.tables.outbox.contains_key(&key)
                || self.records.iter().any(|r| {
                    r.aggregate_key() == record.aggregate_key()
                        && r.sequence_number == record.sequence_number
                });
            if duplicate_seq {
                return Err(DomainError::Conflict {
                    reason: format!(
                        "duplicate sequence {} for {}/{}",
                        record.sequence_number, record.aggregate_type, record.aggregate_id
                    ),
                });
            }

            let duplicate_id = self.tables.by_message_id.contains_key(&record.message_id)
                || self.records.iter().any(|r| r.message_id == record.message_id);
            if duplicate_id {
                return Err(DomainError::Conflict {
                    reason: format!("duplicate message id {}", record.message_id),
                });
            }

            self.records.push(record.clone());
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.fail_on_commit {
            return Err(DomainError::storage("injected commit failure"));
        }

        let InMemoryTransaction {
            mut tables,
            states,
            sequences,
            records,
            ..
        } = *self;

        for state in states {
            let key = (
                state.aggregate_type().to_string(),
                state.aggregate_id().to_string(),
            );
            tables.states.insert(key, state);
        }
        tables.sequences.extend(sequences);
        for record in records {
            let key = (
                record.aggregate_type.clone(),
                record.aggregate_id.clone(),
                record.sequence_number,
            );
            tables.by_message_id.insert(record.message_id, key.clone());
            tables.outbox.insert(key, record);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<OutboxRecord>> {
        let mut tables = self.tables.lock().await;
        let mut claimed = Vec::new();
        let mut current: Option<AggregateKey> = None;
        let mut blocked = false;

        for record in tables.outbox.values_mut() {
            if claimed.len() >= request.batch_size {
                break;
            }

            let key = (record.aggregate_type.clone(), record.aggregate_id.clone());
            if current.as_ref() != Some(&key) {
                current = Some(key);
                blocked = false;
            }

            if blocked || record.status.is_terminal() {
                continue;
            }

            if !record.is_claimable_at(request.now) {
                // 同一聚合中更早的记录仍在途或在退避中，后续记录一律不认领
                blocked = true;
                continue;
            }

            record.status = OutboxStatus::Claimed;
            record.claim_token = Some(request.token);
            record.lease_expires_at = Some(request.lease_expires_at());
            claimed.push(record.clone());
        }

        Ok(claimed)
    }

    async fn mark_dispatched(
        &self,
        message_id: MessageId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables.update_held(message_id, token, |r| {
            r.status = OutboxStatus::Dispatched;
            r.dispatched_at = Some(now);
        }))
    }

    async fn mark_failed(
        &self,
        message_id: MessageId,
        token: ClaimToken,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables.update_held(message_id, token, |r| {
            r.status = OutboxStatus::Failed;
            r.attempts += 1;
            r.last_error = Some(error.to_string());
            r.available_at = retry_at;
        }))
    }

    async fn mark_dead_lettered(
        &self,
        message_id: MessageId,
        token: ClaimToken,
        error: &str,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables.update_held(message_id, token, |r| {
            r.status = OutboxStatus::DeadLettered;
            r.attempts += 1;
            r.last_error = Some(error.to_string());
        }))
    }

    async fn release(&self, message_id: MessageId, token: ClaimToken) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables.update_held(message_id, token, |r| {
            r.status = OutboxStatus::Pending;
        }))
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut reclaimed = 0;
        for record in tables.outbox.values_mut() {
            let expired = record.status == OutboxStatus::Claimed
                && record.lease_expires_at.is_some_and(|at| at < now);
            if expired {
                record.status = OutboxStatus::Pending;
                record.claim_token = None;
                record.lease_expires_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, message_id: MessageId) -> Result<Option<OutboxRecord>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.find_mut(message_id).map(|r| r.clone()))
    }

    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .outbox
            .values()
            .filter(|r| r.status == OutboxStatus::DeadLettered)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue_dead_lettered(
        &self,
        message_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.find_mut(message_id) {
            Some(r) if r.status == OutboxStatus::DeadLettered => {
                r.status = OutboxStatus::Pending;
                r.attempts = 0;
                r.last_error = None;
                r.claim_token = None;
                r.lease_expires_at = None;
                r.available_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let tables = self.tables.lock().await;
        let mut counts = StatusCounts::default();
        for status in OutboxStatus::ALL {
            let n = tables.outbox.values().filter(|r| r.status == status).count();
            counts.set(status, n as u64);
        }
        Ok(counts)
    }

    async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let purged: Vec<(RecordKey, MessageId)> = tables
            .outbox
            .iter()
            .filter(|(_, r)| {
                r.status == OutboxStatus::Dispatched
                    && r.dispatched_at.is_some_and(|at| at < older_than)
            })
            .map(|(k, r)| (k.clone(), r.message_id))
            .collect();

        for (key, message_id) in &purged {
            tables.outbox.remove(key);
            tables.by_message_id.remove(message_id);
        }
        Ok(purged.len() as u64)
    }
}

#[async_trait]
impl StateReader for InMemoryOutboxStore {
    async fn load_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        include_deleted: bool,
    ) -> Result<Option<AggregateState>> {
        let tables = self.tables.lock().await;
        let key = (aggregate_type.to_string(), aggregate_id.to_string());
        let last_sequence = tables.sequences.get(&key).copied().unwrap_or(0);

        Ok(tables
            .states
            .get(&key)
            .filter(|s| include_deleted || !s.is_deleted())
            .map(|s| s.clone().with_last_sequence(last_sequence)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_event::DomainEvent;
    use chrono::Duration;
    use serde_json::json;

    async fn seed(store: &InMemoryOutboxStore, aggregate_id: &str, n: u64) -> Vec<OutboxRecord> {
        let mut tx = store.begin().await.unwrap();
        let first = tx.allocate_sequences("order", aggregate_id, n).await.unwrap();
        let now = Utc::now();
        let records: Vec<OutboxRecord> = (0..n)
            .map(|i| {
                let ev =
                    DomainEvent::new("order", aggregate_id, "OrderEvent.Placed", json!({"i": i}));
                OutboxRecord::pending(&ev, first + i, now).unwrap()
            })
            .collect();
        tx.insert_outbox(&records).await.unwrap();
        tx.commit().await.unwrap();
        records
    }

    fn claim(batch_size: usize, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest::builder()
            .batch_size(batch_size)
            .lease(Duration::seconds(30))
            .now(now)
            .build()
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_nothing_behind() {
        let store = InMemoryOutboxStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            let first = tx.allocate_sequences("order", "o-1", 2).await.unwrap();
            assert_eq!(first, 1);
            let ev = DomainEvent::new("order", "o-1", "OrderEvent.Placed", json!({}));
            tx.insert_outbox(&[OutboxRecord::pending(&ev, 1, Utc::now()).unwrap()])
                .await
                .unwrap();
        }
        assert!(store.records().await.is_empty());

        // 回滚后的计数器也未推进
        let records = seed(&store, "o-1", 1).await;
        assert_eq!(records[0].sequence_number(), 1);
    }

    #[tokio::test]
    async fn duplicate_sequence_is_a_conflict() {
        let store = InMemoryOutboxStore::new();
        seed(&store, "o-1", 1).await;

        let mut tx = store.begin().await.unwrap();
        let ev = DomainEvent::new("order", "o-1", "OrderEvent.Placed", json!({}));
        let err = tx
            .insert_outbox(&[OutboxRecord::pending(&ev, 1, Utc::now()).unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict { .. }));
    }

    #[tokio::test]
    async fn second_claimer_observes_zero_rows() {
        let store = InMemoryOutboxStore::new();
        seed(&store, "o-1", 1).await;
        let now = Utc::now();

        let first = store.claim_batch(&claim(10, now)).await.unwrap();
        let second = store.claim_batch(&claim(10, now)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn later_sequence_waits_for_in_flight_head() {
        let store = InMemoryOutboxStore::new();
        seed(&store, "o-1", 3).await;
        let now = Utc::now();

        // 只认领到头部一条
        let head = store.claim_batch(&claim(1, now)).await.unwrap();
        assert_eq!(head[0].sequence_number(), 1);

        // 头部仍在租约内，另一个投递器拿不到 2、3
        assert!(store.claim_batch(&claim(10, now)).await.unwrap().is_empty());

        let token = head[0].claim_token().unwrap();
        assert!(store.mark_dispatched(head[0].message_id(), token, now).await.unwrap());

        let rest = store.claim_batch(&claim(10, now)).await.unwrap();
        let seqs: Vec<u64> = rest.iter().map(|r| r.sequence_number()).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[tokio::test]
    async fn failed_head_blocks_until_backoff_elapses() {
        let store = InMemoryOutboxStore::new();
        seed(&store, "o-1", 2).await;
        let now = Utc::now();

        let batch = store.claim_batch(&claim(1, now)).await.unwrap();
        let token = batch[0].claim_token().unwrap();
        let retry_at = now + Duration::seconds(5);
        assert!(
            store
                .mark_failed(batch[0].message_id(), token, "boom", retry_at)
                .await
                .unwrap()
        );

        assert!(store.claim_batch(&claim(10, now)).await.unwrap().is_empty());

        let later = store
            .claim_batch(&claim(10, retry_at + Duration::milliseconds(1)))
            .await
            .unwrap();
        assert_eq!(later.len(), 2);
        assert_eq!(later[0].attempts(), 1);
        assert_eq!(later[0].last_error(), Some("boom"));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_with_new_token() {
        let store = InMemoryOutboxStore::new();
        seed(&store, "o-1", 1).await;
        let now = Utc::now();

        let first = store.claim_batch(&claim(10, now)).await.unwrap();
        let stale = first[0].claim_token().unwrap();

        let after_lease = now + Duration::seconds(31);
        let second = store.claim_batch(&claim(10, after_lease)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].claim_token(), Some(stale));

        // 旧持有者的标记不再生效
        assert!(
            !store
                .mark_dispatched(first[0].message_id(), stale, after_lease)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn sweep_returns_expired_claims_to_pending() {
        let store = InMemoryOutboxStore::new();
        seed(&store, "o-1", 2).await;
        let now = Utc::now();
        store.claim_batch(&claim(10, now)).await.unwrap();

        assert_eq!(store.reclaim_expired_leases(now).await.unwrap(), 0);
        let reclaimed = store
            .reclaim_expired_leases(now + Duration::seconds(31))
            .await
            .unwrap();
        assert_eq!(reclaimed, 2);

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.get(OutboxStatus::Pending), 2);
        assert_eq!(counts.get(OutboxStatus::Claimed), 0);
    }

    #[tokio::test]
    async fn dead_letter_is_terminal_until_requeued() {
        let store = InMemoryOutboxStore::new();
        seed(&store, "o-1", 2).await;
        let now = Utc::now();

        let batch = store.claim_batch(&claim(1, now)).await.unwrap();
        let id = batch[0].message_id();
        let token = batch[0].claim_token().unwrap();
        assert!(store.mark_dead_lettered(id, token, "rejected").await.unwrap());

        // 死信不阻塞后续序列号，但自身永远不会被自动认领
        let far_future = now + Duration::days(30);
        let next = store.claim_batch(&claim(10, far_future)).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].sequence_number(), 2);

        let dead = store.list_dead_lettered(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts(), 1);

        assert!(store.requeue_dead_lettered(id, now).await.unwrap());
        let requeued = store.get(id).await.unwrap().unwrap();
        assert_eq!(requeued.status(), OutboxStatus::Pending);
        assert_eq!(requeued.attempts(), 0);
        assert!(requeued.last_error().is_none());
        assert!(!store.requeue_dead_lettered(id, now).await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_only_old_dispatched() {
        let store = InMemoryOutboxStore::new();
        seed(&store, "o-1", 2).await;
        let now = Utc::now();

        let batch = store.claim_batch(&claim(1, now)).await.unwrap();
        let token = batch[0].claim_token().unwrap();
        store
            .mark_dispatched(batch[0].message_id(), token, now)
            .await
            .unwrap();

        assert_eq!(store.purge_dispatched(now).await.unwrap(), 0);
        assert_eq!(
            store
                .purge_dispatched(now + Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn soft_deleted_state_is_hidden_unless_requested() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin().await.unwrap();
        let state = AggregateState::builder()
            .aggregate_type("order")
            .aggregate_id("o-9")
            .state(json!({"id": "o-9"}))
            .is_deleted(true)
            .build();
        tx.save_state(&state).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.load_state("order", "o-9", false).await.unwrap().is_none());
        let loaded = store.load_state("order", "o-9", true).await.unwrap().unwrap();
        assert!(loaded.is_deleted());
    }
}
