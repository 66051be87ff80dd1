//! 需要真实 Postgres：`DATABASE_URL=postgres://... cargo test --features infra-sqlx -- --ignored`
//!
//! 每个用例先清空表并串行执行，认领结果不受其它用例残留记录影响。
use anyhow::Result as AnyResult;
use chrono::{Duration, Utc};
use outbox_core::domain_event::DomainEvent;
use outbox_core::persist::{
    AggregateState, ClaimRequest, OutboxRecord, OutboxStatus, OutboxStore, PgOutboxStore,
    StateReader, TransactionalStore,
};
use outbox_core::value_object::{ClaimToken, MessageId};
use serde_json::json;
use std::collections::HashSet;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

static DB: Mutex<()> = Mutex::const_new(());

async fn store() -> AnyResult<(MutexGuard<'static, ()>, PgOutboxStore)> {
    let guard = DB.lock().await;
    let url = std::env::var("DATABASE_URL")?;
    let store = PgOutboxStore::connect(&url).await?;
    store.migrate().await?;
    sqlx::query("TRUNCATE outbox, outbox_sequences, outbox_aggregate_state")
        .execute(store.pool())
        .await?;
    Ok((guard, store))
}

async fn commit_events(store: &PgOutboxStore, aggregate_id: &str, n: u64) -> AnyResult<()> {
    let mut tx = store.begin().await?;
    tx.save_state(
        &AggregateState::builder()
            .aggregate_type("order")
            .aggregate_id(aggregate_id)
            .state(json!({ "id": aggregate_id }))
            .build(),
    )
    .await?;
    let first = tx.allocate_sequences("order", aggregate_id, n).await?;
    let now = Utc::now();
    let records = (0..n)
        .map(|i| {
            let ev =
                DomainEvent::new("order", aggregate_id, "OrderEvent.Placed", json!({ "i": i }));
            OutboxRecord::pending(&ev, first + i, now)
        })
        .collect::<Result<Vec<_>, _>>()?;
    tx.insert_outbox(&records).await?;
    tx.commit().await?;
    Ok(())
}

fn request(batch_size: usize) -> ClaimRequest {
    ClaimRequest::builder()
        .batch_size(batch_size)
        .lease(Duration::seconds(30))
        .build()
}

/// 认领后立刻过期的批次，模拟仍在标记途中的旧持有者
async fn claim_expired(store: &PgOutboxStore) -> AnyResult<(ClaimToken, Vec<OutboxRecord>)> {
    let short = ClaimRequest::builder()
        .batch_size(1000)
        .lease(Duration::milliseconds(1))
        .build();
    let claimed = store.claim_batch(&short).await?;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    Ok((short.token, claimed))
}

/// 在未提交的事务里按旧令牌标记记录，同时另一个投递器发起认领；标记提交后再取认领结果
async fn claim_while_marking(
    store: &PgOutboxStore,
    set_clause: &str,
    message_id: MessageId,
    token: ClaimToken,
) -> AnyResult<Vec<OutboxRecord>> {
    let mut marking = store.pool().begin().await?;
    let marked = sqlx::query(&format!(
        "UPDATE outbox SET {set_clause}, claim_token = NULL, lease_expires_at = NULL \
         WHERE message_id = $1 AND status = 'claimed' AND claim_token = $2"
    ))
    .bind(message_id.as_uuid())
    .bind(token.as_uuid())
    .execute(&mut *marking)
    .await?;
    assert_eq!(marked.rows_affected(), 1);

    let claimer = tokio::spawn({
        let store = store.clone();
        async move { store.claim_batch(&request(1000)).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    marking.commit().await?;

    Ok(claimer.await??)
}

#[tokio::test]
#[ignore]
async fn sequences_are_gapless_across_transactions() -> AnyResult<()> {
    let (_db, store) = store().await?;
    let id = format!("o-{}", Uuid::new_v4());

    commit_events(&store, &id, 2).await?;
    commit_events(&store, &id, 1).await?;

    // 回滚的事务不消耗序列号
    let mut tx = store.begin().await?;
    tx.allocate_sequences("order", &id, 5).await?;
    tx.rollback().await?;
    commit_events(&store, &id, 1).await?;

    let state = store.load_state("order", &id, false).await?.expect("state");
    assert_eq!(state.last_sequence(), 4);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn claim_respects_head_of_line_and_tokens() -> AnyResult<()> {
    let (_db, store) = store().await?;
    let id = format!("o-{}", Uuid::new_v4());
    commit_events(&store, &id, 3).await?;

    let first = request(1000);
    let claimed = store.claim_batch(&first).await?;
    let seqs: Vec<u64> = claimed.iter().map(|r| r.sequence_number()).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    // 已被认领的聚合不会再被他人认领
    let second = request(1000);
    assert!(store.claim_batch(&second).await?.is_empty());

    // 令牌不匹配的更新不生效
    let head = claimed[0].message_id();
    assert!(!store.mark_dispatched(head, second.token, Utc::now()).await?);
    assert!(store.mark_dispatched(head, first.token, Utc::now()).await?);

    let retry_at = Utc::now() + Duration::minutes(5);
    assert!(
        store
            .mark_failed(claimed[1].message_id(), first.token, "broker down", retry_at)
            .await?
    );
    assert!(store.release(claimed[2].message_id(), first.token).await?);

    // seq 2 在退避中，seq 3 被阻塞
    assert!(store.claim_batch(&request(1000)).await?.is_empty());

    let failed = store.get(claimed[1].message_id()).await?.expect("record");
    assert_eq!(failed.status(), OutboxStatus::Failed);
    assert_eq!(failed.attempts(), 1);
    assert_eq!(failed.last_error(), Some("broker down"));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn expired_leases_are_reclaimed() -> AnyResult<()> {
    let (_db, store) = store().await?;
    let id = format!("o-{}", Uuid::new_v4());
    commit_events(&store, &id, 1).await?;

    let (_, claimed) = claim_expired(&store).await?;
    assert_eq!(claimed.len(), 1);

    let later = Utc::now() + Duration::seconds(1);
    assert_eq!(store.reclaim_expired_leases(later).await?, 1);

    let record = store.get(claimed[0].message_id()).await?.expect("record");
    assert_eq!(record.status(), OutboxStatus::Pending);
    assert_eq!(record.attempts(), 0);
    assert!(record.claim_token().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn dead_letter_committed_during_claim_stays_terminal() -> AnyResult<()> {
    let (_db, store) = store().await?;
    let id = format!("o-{}", Uuid::new_v4());
    commit_events(&store, &id, 2).await?;

    let (stale, claimed) = claim_expired(&store).await?;
    let head = claimed[0].message_id();

    let reclaimed = claim_while_marking(
        &store,
        "status = 'dead_lettered', attempts = attempts + 1, last_error = 'rejected'",
        head,
        stale,
    )
    .await?;

    // 死信是终态，不阻塞后续序列号
    let seqs: Vec<u64> = reclaimed.iter().map(|r| r.sequence_number()).collect();
    assert_eq!(seqs, vec![2]);

    let dead = store.get(head).await?.expect("record");
    assert_eq!(dead.status(), OutboxStatus::DeadLettered);
    assert_eq!(dead.attempts(), 1);
    assert!(dead.claim_token().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn failure_committed_during_claim_keeps_backoff_and_order() -> AnyResult<()> {
    let (_db, store) = store().await?;
    let id = format!("o-{}", Uuid::new_v4());
    commit_events(&store, &id, 2).await?;

    let (stale, claimed) = claim_expired(&store).await?;
    let head = claimed[0].message_id();

    let reclaimed = claim_while_marking(
        &store,
        "status = 'failed', attempts = attempts + 1, last_error = 'broker down', \
         available_at = now() + interval '5 minutes'",
        head,
        stale,
    )
    .await?;

    // seq 1 在退避中，seq 2 不能越过它
    assert!(reclaimed.is_empty());

    let failed = store.get(head).await?.expect("record");
    assert_eq!(failed.status(), OutboxStatus::Failed);
    assert!(failed.available_at() > Utc::now());
    assert!(failed.claim_token().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn concurrent_claims_never_share_a_record() -> AnyResult<()> {
    let (_db, store) = store().await?;
    for i in 0..10 {
        commit_events(&store, &format!("o-{i}"), 2).await?;
    }

    let (req_a, req_b) = (request(1000), request(1000));
    let (a, b) = tokio::join!(store.claim_batch(&req_a), store.claim_batch(&req_b));
    let (a, b) = (a?, b?);

    let a_ids: HashSet<MessageId> = a.iter().map(|r| r.message_id()).collect();
    let b_ids: HashSet<MessageId> = b.iter().map(|r| r.message_id()).collect();
    assert!(a_ids.is_disjoint(&b_ids));
    assert_eq!(a_ids.len() + b_ids.len(), 20);

    // 同一聚合的记录总在同一个批次里
    let a_aggs: HashSet<&str> = a.iter().map(|r| r.aggregate_id()).collect();
    assert!(b.iter().all(|r| !a_aggs.contains(r.aggregate_id())));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn dead_letters_are_never_reclaimed_until_requeued() -> AnyResult<()> {
    let (_db, store) = store().await?;
    let id = format!("o-{}", Uuid::new_v4());
    commit_events(&store, &id, 1).await?;

    let first = request(1000);
    let claimed = store.claim_batch(&first).await?;
    let message_id = claimed[0].message_id();
    assert!(store.mark_dead_lettered(message_id, first.token, "rejected").await?);

    let far = Utc::now() + Duration::hours(1);
    assert_eq!(store.reclaim_expired_leases(far).await?, 0);
    let later = ClaimRequest::builder()
        .batch_size(1000)
        .lease(Duration::seconds(30))
        .now(far)
        .build();
    assert!(store.claim_batch(&later).await?.is_empty());

    let listed = store.list_dead_lettered(10).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].last_error(), Some("rejected"));

    assert!(store.requeue_dead_lettered(message_id, Utc::now()).await?);
    assert!(!store.requeue_dead_lettered(message_id, Utc::now()).await?);

    let requeued = store.get(message_id).await?.expect("record");
    assert_eq!(requeued.status(), OutboxStatus::Pending);
    assert_eq!(requeued.attempts(), 0);
    assert!(requeued.last_error().is_none());

    let again = store.claim_batch(&request(1000)).await?;
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id(), message_id);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn purge_removes_only_old_dispatched_records() -> AnyResult<()> {
    let (_db, store) = store().await?;
    let id = format!("o-{}", Uuid::new_v4());
    commit_events(&store, &id, 2).await?;

    let batch = request(1000);
    let claimed = store.claim_batch(&batch).await?;
    let old = Utc::now() - Duration::days(2);
    assert!(store.mark_dispatched(claimed[0].message_id(), batch.token, old).await?);
    assert!(store.release(claimed[1].message_id(), batch.token).await?);

    let purged = store.purge_dispatched(Utc::now() - Duration::days(1)).await?;
    assert_eq!(purged, 1);
    assert!(store.get(claimed[0].message_id()).await?.is_none());
    assert!(store.get(claimed[1].message_id()).await?.is_some());

    let counts = store.status_counts().await?;
    assert_eq!(counts.get(OutboxStatus::Pending), 1);
    assert_eq!(counts.total(), 1);
    Ok(())
}
