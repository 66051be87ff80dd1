//! 提交管道（CommitPipeline）与工作单元（UnitOfWork）
//!
//! 一次业务操作对应一个工作单元：
//! 1. 业务代码显式 `register` 本次变更过的状态根（不做隐式变更追踪）；
//! 2. 需要时通过 `record` 追加不挂在某个状态根上的事件；
//! 3. `commit` 在单个存储事务内写入全部状态、按聚合分配连续序列号并插入 Outbox 记录。
//!
//! 任一步失败（或提交 future 被丢弃）事务即回滚：状态与记录都不会留下，
//! 状态根上的事件缓冲保持原样，由调用方决定丢弃或整体重试。
//!
use crate::{
    aggregate::AggregateRoot,
    domain_event::DomainEvent,
    error::{DomainError, DomainResult},
    persist::{AggregateState, OutboxRecord, StoreTransaction, TransactionalStore},
    value_object::MessageId,
};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// 提交成功后唤醒投递器的信号；轮询仍是兜底
#[derive(Clone, Default, Debug)]
pub struct DispatchSignal {
    inner: Arc<Notify>,
}

impl DispatchSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        // 唤醒所有等待者，并为正在处理批次的投递器留一个许可
        self.inner.notify_waiters();
        self.inner.notify_one();
    }

    pub async fn notified(&self) {
        self.inner.notified().await;
    }
}

/// 提交管道：持有事务型存储，为每次业务操作创建工作单元
#[derive(Clone, Builder)]
pub struct CommitPipeline {
    store: Arc<dyn TransactionalStore>,
    signal: Option<DispatchSignal>,
}

impl CommitPipeline {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            store,
            signal: None,
        }
    }

    pub fn unit_of_work(&self) -> UnitOfWork<'_> {
        UnitOfWork {
            pipeline: self,
            roots: Vec::new(),
            events: Vec::new(),
        }
    }
}

/// 提交结果
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    records: Vec<OutboxRecord>,
    committed_at: Option<DateTime<Utc>>,
}

impl CommitReceipt {
    /// 本次写入的 Outbox 记录，按聚合与序列号排列
    pub fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    pub fn message_ids(&self) -> Vec<MessageId> {
        self.records.iter().map(|r| r.message_id()).collect()
    }

    pub fn committed_at(&self) -> Option<DateTime<Utc>> {
        self.committed_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// 单次业务操作的显式写集合
pub struct UnitOfWork<'a> {
    pipeline: &'a CommitPipeline,
    roots: Vec<&'a mut dyn AggregateRoot>,
    events: Vec<DomainEvent>,
}

type AggregateKey = (String, String);

/// 同一聚合的事件，按记录顺序
struct EventGroup<'e> {
    key: AggregateKey,
    events: Vec<&'e DomainEvent>,
}

impl<'a> UnitOfWork<'a> {
    /// 登记一个本次变更过的状态根
    pub fn register(&mut self, root: &'a mut dyn AggregateRoot) -> &mut Self {
        self.roots.push(root);
        self
    }

    /// 追加一条不挂在已登记状态根上的事件；校验失败立即返回
    pub fn record(
        &mut self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> DomainResult<&mut Self> {
        let event = DomainEvent::new(aggregate_type, aggregate_id, event_type, payload);
        self.record_event(event)
    }

    pub fn record_event(&mut self, event: DomainEvent) -> DomainResult<&mut Self> {
        event.validate()?;
        self.events.push(event);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty() && self.events.is_empty()
    }

    /// 原子提交：要么状态与全部记录一起落盘，要么什么都不留下
    pub async fn commit(self) -> DomainResult<CommitReceipt> {
        let UnitOfWork {
            pipeline,
            mut roots,
            events,
        } = self;

        if roots.is_empty() && events.is_empty() {
            return Err(DomainError::validation("empty unit of work"));
        }

        let states = Self::prepare_states(&roots)?;
        let committed_at = Utc::now();

        let (records, last_sequences) = {
            let groups = Self::group_events(&roots, &events);
            let mut tx = pipeline.store.begin().await?;

            match Self::write(&mut *tx, &states, &groups, committed_at).await {
                Ok(written) => {
                    tx.commit().await?;
                    written
                }
                Err(err) => {
                    warn!(error = %err, "commit aborted, rolling back");
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "rollback failed");
                    }
                    return Err(err);
                }
            }
        };

        for root in roots.iter_mut() {
            let key = (root.aggregate_type().to_string(), root.aggregate_id());
            let last = match last_sequences.get(&key) {
                Some(last) => *last,
                None => root.last_sequence(),
            };
            root.mark_committed(last);
        }

        debug!(
            roots = roots.len(),
            records = records.len(),
            aggregates = last_sequences.len(),
            "unit of work committed"
        );

        if !records.is_empty() {
            if let Some(signal) = &pipeline.signal {
                signal.notify();
            }
        }

        Ok(CommitReceipt {
            records,
            committed_at: Some(committed_at),
        })
    }

    fn prepare_states(roots: &[&'a mut dyn AggregateRoot]) -> DomainResult<Vec<AggregateState>> {
        let mut seen: Vec<AggregateKey> = Vec::with_capacity(roots.len());
        let mut states = Vec::with_capacity(roots.len());

        for root in roots {
            let key = (root.aggregate_type().to_string(), root.aggregate_id());
            if key.1.is_empty() {
                return Err(DomainError::validation(format!(
                    "missing aggregate id for {}",
                    key.0
                )));
            }
            if seen.contains(&key) {
                return Err(DomainError::validation(format!(
                    "aggregate {}/{} registered twice",
                    key.0, key.1
                )));
            }
            for event in root.pending_events() {
                event.validate()?;
            }
            states.push(root.to_state()?);
            seen.push(key);
        }

        states.sort_by(|a, b| {
            (a.aggregate_type(), a.aggregate_id()).cmp(&(b.aggregate_type(), b.aggregate_id()))
        });
        Ok(states)
    }

    /// 按聚合分组，组内保持记录顺序；已登记状态根的事件排在同聚合的零散事件之前
    fn group_events<'e>(
        roots: &'e [&'a mut dyn AggregateRoot],
        events: &'e [DomainEvent],
    ) -> Vec<EventGroup<'e>> {
        let mut groups: Vec<EventGroup<'e>> = Vec::new();
        let mut index: HashMap<AggregateKey, usize> = HashMap::new();

        let root_events = roots.iter().flat_map(|r| r.pending_events().iter());
        for event in root_events.chain(events.iter()) {
            let key = (
                event.aggregate_type().to_string(),
                event.aggregate_id().to_string(),
            );
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                groups.push(EventGroup {
                    key,
                    events: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].events.push(event);
        }

        // 固定按聚合键加锁，交叉触及同一批聚合的并发提交不会互相死锁
        groups.sort_by(|a, b| a.key.cmp(&b.key));
        groups
    }

    async fn write(
        tx: &mut dyn StoreTransaction,
        states: &[AggregateState],
        groups: &[EventGroup<'_>],
        committed_at: DateTime<Utc>,
    ) -> DomainResult<(Vec<OutboxRecord>, HashMap<AggregateKey, u64>)> {
        for state in states {
            tx.save_state(state).await?;
        }

        let mut records = Vec::new();
        let mut last_sequences = HashMap::with_capacity(groups.len());

        for group in groups {
            let (aggregate_type, aggregate_id) = &group.key;
            let count = group.events.len() as u64;
            let first = tx
                .allocate_sequences(aggregate_type, aggregate_id, count)
                .await?;

            for (offset, event) in group.events.iter().enumerate() {
                records.push(OutboxRecord::pending(
                    event,
                    first + offset as u64,
                    committed_at,
                )?);
            }
            last_sequences.insert(group.key.clone(), first + count - 1);
        }

        if !records.is_empty() {
            tx.insert_outbox(&records).await?;
        }

        Ok((records, last_sequences))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregate;
    use crate::entity::Entity;
    use crate::persist::{InMemoryOutboxStore, OutboxStatus, StateReader, load_aggregate};
    use outbox_macros::{aggregate_root, domain_event};
    use serde_json::json;
    use std::time::Duration;

    #[aggregate_root(type = "account")]
    #[derive(Clone)]
    struct Account {
        balance: i64,
    }

    #[domain_event]
    enum AccountEvent {
        Deposited { amount: i64 },
        Withdrawn { amount: i64 },
    }

    impl Account {
        fn deposit(&mut self, amount: i64) -> DomainResult<()> {
            if amount <= 0 {
                return Err(DomainError::validation("amount must be > 0"));
            }
            self.balance += amount;
            self.raise(&AccountEvent::Deposited { amount })
        }

        fn withdraw(&mut self, amount: i64) -> DomainResult<()> {
            if amount > self.balance {
                return Err(DomainError::validation("insufficient funds"));
            }
            self.balance -= amount;
            self.raise(&AccountEvent::Withdrawn { amount })
        }
    }

    fn pipeline(store: &InMemoryOutboxStore) -> CommitPipeline {
        CommitPipeline::new(Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn two_events_on_one_aggregate_get_sequences_one_and_two() {
        let store = InMemoryOutboxStore::new();
        let pipeline = pipeline(&store);

        let mut acc = Account::new("a-1".to_string());
        acc.deposit(100).unwrap();
        acc.withdraw(30).unwrap();

        let mut uow = pipeline.unit_of_work();
        uow.register(&mut acc);
        let receipt = uow.commit().await.unwrap();
        assert_eq!(receipt.len(), 2);

        let records = store.records_for("account", "a-1").await;
        let seqs: Vec<u64> = records.iter().map(|r| r.sequence_number()).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(records.iter().all(|r| r.status() == OutboxStatus::Pending));
        assert_eq!(records[0].event_type(), "AccountEvent.Deposited");
        assert_eq!(records[0].occurred_at(), receipt.committed_at().unwrap());

        assert!(acc.pending_events().is_empty());
        assert_eq!(AggregateRoot::last_sequence(&acc), 2);
    }

    #[tokio::test]
    async fn sequences_continue_across_commits() {
        let store = InMemoryOutboxStore::new();
        let pipeline = pipeline(&store);

        let mut acc = Account::new("a-2".to_string());
        acc.deposit(10).unwrap();
        let mut uow = pipeline.unit_of_work();
        uow.register(&mut acc);
        uow.commit().await.unwrap();

        let mut reloaded: Account = load_aggregate(&store, &"a-2".to_string(), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.balance, 10);
        assert_eq!(reloaded.recorder().last_sequence(), 1);

        reloaded.deposit(5).unwrap();
        let mut uow = pipeline.unit_of_work();
        uow.register(&mut reloaded);
        let receipt = uow.commit().await.unwrap();
        assert_eq!(receipt.records()[0].sequence_number(), 2);
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_state_and_no_records() {
        let store = InMemoryOutboxStore::new();
        store.set_fail_on_commit(true);
        let pipeline = pipeline(&store);

        let mut acc = Account::new("a-3".to_string());
        acc.deposit(50).unwrap();
        let mut uow = pipeline.unit_of_work();
        uow.register(&mut acc);
        assert!(matches!(
            uow.commit().await,
            Err(DomainError::Storage { .. })
        ));

        assert!(store.records().await.is_empty());
        assert!(store.load_state("account", "a-3", true).await.unwrap().is_none());
        // 事件缓冲保持原样，由调用方决定是否重试
        assert_eq!(acc.pending_events().len(), 1);

        store.set_fail_on_commit(false);
        let mut uow = pipeline.unit_of_work();
        uow.register(&mut acc);
        let receipt = uow.commit().await.unwrap();
        assert_eq!(receipt.records()[0].sequence_number(), 1);
    }

    #[tokio::test]
    async fn invalid_loose_event_fails_before_storage() {
        let store = InMemoryOutboxStore::new();
        let pipeline = pipeline(&store);

        let mut uow = pipeline.unit_of_work();
        let err = uow.record("account", "", "AccountEvent.Opened", json!({}));
        assert!(matches!(err, Err(DomainError::Validation { .. })));
        assert!(uow.is_empty());
        assert!(matches!(
            uow.commit().await,
            Err(DomainError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn loose_events_and_roots_commit_together() {
        let store = InMemoryOutboxStore::new();
        let signal = DispatchSignal::new();
        let pipeline = CommitPipeline::builder()
            .store(Arc::new(store.clone()) as Arc<dyn TransactionalStore>)
            .signal(signal.clone())
            .build();

        let mut a = Account::new("a-4".to_string());
        let mut b = Account::new("a-5".to_string());
        a.deposit(1).unwrap();
        b.deposit(2).unwrap();

        let mut uow = pipeline.unit_of_work();
        uow.register(&mut a).register(&mut b);
        uow.record("audit", "day-1", "AuditEvent.Noted", json!({"n": 1}))
            .unwrap()
            .record("account", "a-4", "AccountEvent.Flagged", json!({}))
            .unwrap();

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.notified().await }
        });

        let receipt = uow.commit().await.unwrap();
        assert_eq!(receipt.len(), 4);

        let a_records = store.records_for("account", "a-4").await;
        let a_types: Vec<&str> = a_records.iter().map(|r| r.event_type()).collect();
        assert_eq!(a_types, vec!["AccountEvent.Deposited", "AccountEvent.Flagged"]);
        assert_eq!(a.recorder().last_sequence(), 2);
        assert_eq!(store.records_for("audit", "day-1").await.len(), 1);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    /// 记录事务内写操作顺序的存储
    #[derive(Clone, Default)]
    struct SpyStore {
        inner: InMemoryOutboxStore,
        calls: Arc<std::sync::Mutex<Vec<String>>>,
    }

    struct SpyTransaction {
        inner: Box<dyn StoreTransaction>,
        calls: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl TransactionalStore for SpyStore {
        async fn begin(&self) -> DomainResult<Box<dyn StoreTransaction>> {
            Ok(Box::new(SpyTransaction {
                inner: self.inner.begin().await?,
                calls: self.calls.clone(),
            }))
        }
    }

    #[async_trait::async_trait]
    impl StoreTransaction for SpyTransaction {
        async fn save_state(&mut self, state: &AggregateState) -> DomainResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("state {}", state.aggregate_id()));
            self.inner.save_state(state).await
        }

        async fn allocate_sequences(
            &mut self,
            aggregate_type: &str,
            aggregate_id: &str,
            count: u64,
        ) -> DomainResult<u64> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("seq {aggregate_id}"));
            self.inner
                .allocate_sequences(aggregate_type, aggregate_id, count)
                .await
        }

        async fn insert_outbox(&mut self, records: &[OutboxRecord]) -> DomainResult<()> {
            self.inner.insert_outbox(records).await
        }

        async fn commit(self: Box<Self>) -> DomainResult<()> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> DomainResult<()> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn writes_follow_aggregate_key_order_not_registration_order() {
        let spy = SpyStore::default();
        let pipeline = CommitPipeline::new(Arc::new(spy.clone()));

        let mut a = Account::new("a-8".to_string());
        let mut b = Account::new("a-9".to_string());
        a.deposit(1).unwrap();
        b.deposit(2).unwrap();

        let mut uow = pipeline.unit_of_work();
        uow.register(&mut b).register(&mut a);
        let receipt = uow.commit().await.unwrap();

        assert_eq!(
            *spy.calls.lock().unwrap(),
            vec!["state a-8", "state a-9", "seq a-8", "seq a-9"]
        );
        let ids: Vec<&str> = receipt.records().iter().map(|r| r.aggregate_id()).collect();
        assert_eq!(ids, vec!["a-8", "a-9"]);
        assert_eq!(a.recorder().last_sequence(), 1);
        assert_eq!(b.recorder().last_sequence(), 1);
    }

    #[tokio::test]
    async fn soft_delete_is_persisted_as_a_flag() {
        let store = InMemoryOutboxStore::new();
        let pipeline = pipeline(&store);

        let mut acc = Account::new("a-6".to_string());
        acc.deposit(1).unwrap();
        acc.set_deleted(true);
        let mut uow = pipeline.unit_of_work();
        uow.register(&mut acc);
        uow.commit().await.unwrap();

        let hidden: Option<Account> = load_aggregate(&store, &"a-6".to_string(), false)
            .await
            .unwrap();
        assert!(hidden.is_none());

        let visible: Account = load_aggregate(&store, &"a-6".to_string(), true)
            .await
            .unwrap()
            .unwrap();
        assert!(visible.is_deleted());
    }

    #[tokio::test]
    async fn dropped_commit_future_rolls_back() {
        let store = InMemoryOutboxStore::new();
        let pipeline = pipeline(&store);

        // 另一事务持有表锁，提交在 begin 处挂起后被超时取消
        let blocker = store.begin().await.unwrap();

        let mut acc = Account::new("a-7".to_string());
        acc.deposit(1).unwrap();
        let mut uow = pipeline.unit_of_work();
        uow.register(&mut acc);
        let outcome = tokio::time::timeout(Duration::from_millis(50), uow.commit()).await;
        assert!(outcome.is_err());

        drop(blocker);
        assert!(store.records().await.is_empty());
        assert_eq!(acc.pending_events().len(), 1);
    }
}
