//! 投递器（Dispatcher）
//!
//! 把 `Pending`（以及租约过期的 `Claimed`）记录推进到 `Dispatched`，
//! 或在失败时推进到 `Failed`/`DeadLettered`：
//! - 按批认领，按聚合分组；组间并发，组内按序列号串行，保证同一聚合的投递顺序；
//! - 每次发布独立限时，超时视为暂时失败；
//! - 暂时失败按指数退避重试，本批中同一聚合的后续记录原样释放；
//! - 失败次数达到上限或被永久拒绝即进入死信，交给 `DeadLetterSink`；
//! - 发布前检查租约，过期即停止本组并释放剩余记录。
//!
//! 多个投递器可以同时运行在同一存储上，正确性只依赖存储上的条件更新。
//!
use super::{ClaimCoordinator, ClaimedBatch, DeadLetterSink, EventBus, TracingDeadLetterSink};
use crate::{
    config::{BackoffConfig, DispatcherConfig},
    domain_event::DeliveryEnvelope,
    error::{DomainError, DomainResult as Result},
    persist::{OutboxRecord, OutboxStatus, OutboxStore},
    unit_of_work::DispatchSignal,
    value_object::ClaimToken,
};
use bon::Builder;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use std::{ops::AddAssign, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};
use uuid::Uuid;

/// 一轮投递的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// 因同聚合前序记录失败或租约到期而原样释放的记录
    pub released: usize,
    /// 发布后发现租约已被他人回收的记录（会被重投）
    pub lost_leases: usize,
}

impl AddAssign for DispatchReport {
    fn add_assign(&mut self, other: Self) {
        self.claimed += other.claimed;
        self.dispatched += other.dispatched;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.released += other.released;
        self.lost_leases += other.lost_leases;
    }
}

impl DispatchReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

/// 单条记录的处理结果
enum Outcome {
    Dispatched,
    Retried,
    DeadLettered,
    /// 令牌已失效或存储出错，本组剩余记录不再继续
    Abandoned { lost_lease: bool },
}

#[derive(Builder)]
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn EventBus>,
    #[builder(default = Arc::new(TracingDeadLetterSink))]
    dead_letters: Arc<dyn DeadLetterSink>,
    #[builder(default)]
    config: DispatcherConfig,
    #[builder(default)]
    backoff: BackoffConfig,
    signal: Option<DispatchSignal>,
    #[builder(into, default = format!("dispatcher-{}", Uuid::new_v4().simple()))]
    id: String,
}

impl Dispatcher {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn coordinator(&self) -> Result<ClaimCoordinator> {
        ClaimCoordinator::new(self.store.clone(), &self.config)
    }

    /// 认领并处理一批记录
    pub async fn run_once(&self) -> Result<DispatchReport> {
        let span = info_span!("dispatch_batch", dispatcher = %self.id);
        async {
            let batch = self.coordinator()?.claim().await?;
            let mut report = DispatchReport {
                claimed: batch.len(),
                ..Default::default()
            };
            if batch.is_empty() {
                return Ok(report);
            }

            report += self.dispatch_batch(batch).await;
            debug!(
                claimed = report.claimed,
                dispatched = report.dispatched,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                released = report.released,
                lost_leases = report.lost_leases,
                "batch finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// 回收过期租约
    pub async fn reclaim_expired(&self) -> Result<u64> {
        self.coordinator()?.reclaim_expired().await
    }

    async fn dispatch_batch(&self, batch: ClaimedBatch) -> DispatchReport {
        let token = batch.token;
        let concurrency = self.config.group_concurrency.max(1);

        stream::iter(batch.into_groups())
            .map(|group| self.dispatch_group(token, group))
            .buffer_unordered(concurrency)
            .fold(DispatchReport::default(), |mut acc, r| async move {
                acc += r;
                acc
            })
            .await
    }

    async fn dispatch_group(&self, token: ClaimToken, group: Vec<OutboxRecord>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut records = group.into_iter();
        let mut unpublished = None;

        while let Some(record) = records.next() {
            // 整批共用一个租约；过期后其他投递器可能已接手，不再继续发布
            if lease_expired(&record, Utc::now()) {
                warn!(
                    message_id = %record.message_id(),
                    aggregate_id = record.aggregate_id(),
                    sequence_number = record.sequence_number(),
                    "lease expired before publish, releasing the rest of the group"
                );
                unpublished = Some(record);
                break;
            }

            match self.dispatch_one(token, &record).await {
                Outcome::Dispatched => report.dispatched += 1,
                // 死信是终态，后续序列号可以继续
                Outcome::DeadLettered => report.dead_lettered += 1,
                Outcome::Retried => {
                    report.retried += 1;
                    break;
                }
                Outcome::Abandoned { lost_lease } => {
                    if lost_lease {
                        report.lost_leases += 1;
                    }
                    break;
                }
            }
        }

        for rest in unpublished.into_iter().chain(records) {
            match self.store.release(rest.message_id(), token).await {
                Ok(true) => report.released += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    message_id = %rest.message_id(),
                    error = %err,
                    "failed to release claim, lease expiry will recover it"
                ),
            }
        }

        report
    }

    async fn publish(&self, record: &OutboxRecord) -> Result<()> {
        let envelope = DeliveryEnvelope::from(record);
        let limit = self.config.publish_timeout();
        match time::timeout(limit, self.transport.publish(&envelope)).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::Timeout {
                message_id: record.message_id().to_string(),
                after_ms: limit.as_millis() as u64,
            }),
        }
    }

    async fn dispatch_one(&self, token: ClaimToken, record: &OutboxRecord) -> Outcome {
        let span = info_span!(
            "dispatch_record",
            message_id = %record.message_id(),
            aggregate_type = record.aggregate_type(),
            aggregate_id = record.aggregate_id(),
            sequence_number = record.sequence_number(),
        );

        async {
            match self.publish(record).await {
                Ok(()) => self.on_published(token, record).await,
                Err(err) => self.on_failed(token, record, err).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn on_published(&self, token: ClaimToken, record: &OutboxRecord) -> Outcome {
        match self
            .store
            .mark_dispatched(record.message_id(), token, Utc::now())
            .await
        {
            Ok(true) => Outcome::Dispatched,
            Ok(false) => {
                warn!("lease lost before mark-dispatched, record will be redelivered");
                Outcome::Abandoned { lost_lease: true }
            }
            Err(err) => {
                error!(error = %err, "failed to mark record dispatched");
                Outcome::Abandoned { lost_lease: false }
            }
        }
    }

    async fn on_failed(
        &self,
        token: ClaimToken,
        record: &OutboxRecord,
        err: DomainError,
    ) -> Outcome {
        let attempts = record.attempts() + 1;
        let reason = err.to_string();

        if !err.is_retryable() || attempts >= self.config.max_attempts {
            return self.dead_letter(token, record, &reason).await;
        }

        let delay = self.backoff.delay_for(attempts);
        let at = retry_time(Utc::now(), delay);
        match self
            .store
            .mark_failed(record.message_id(), token, &reason, at)
            .await
        {
            Ok(true) => {
                warn!(
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %reason,
                    "publish failed, retry scheduled"
                );
                Outcome::Retried
            }
            Ok(false) => {
                warn!("lease lost before mark-failed");
                Outcome::Abandoned { lost_lease: true }
            }
            Err(store_err) => {
                error!(error = %store_err, "failed to mark record failed");
                Outcome::Abandoned { lost_lease: false }
            }
        }
    }

    async fn dead_letter(&self, token: ClaimToken, record: &OutboxRecord, reason: &str) -> Outcome {
        match self
            .store
            .mark_dead_lettered(record.message_id(), token, reason)
            .await
        {
            Ok(true) => {
                let mut dead = record.clone();
                dead.status = OutboxStatus::DeadLettered;
                dead.attempts += 1;
                dead.last_error = Some(reason.to_string());
                dead.claim_token = None;
                dead.lease_expires_at = None;

                error!(attempts = dead.attempts, error = reason, "record dead-lettered");
                if let Err(err) = self.dead_letters.dead_lettered(&dead).await {
                    warn!(error = %err, "dead-letter sink failed");
                }
                Outcome::DeadLettered
            }
            Ok(false) => {
                warn!("lease lost before mark-dead-lettered");
                Outcome::Abandoned { lost_lease: true }
            }
            Err(err) => {
                error!(error = %err, "failed to mark record dead-lettered");
                Outcome::Abandoned { lost_lease: false }
            }
        }
    }

    /// 启动投递循环与租约回收循环，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(2);

        // dispatch worker（轮询 + 提交通知）
        tasks.push(tokio::spawn(Self::dispatch_loop(self.clone(), token.clone())));

        // reclaim worker（周期任务）
        {
            let this = self.clone();
            let interval = self.config.reclaim_interval();

            tasks.push(Self::spawn_periodic(token.clone(), interval, move || {
                let this = this.clone();
                async move {
                    if let Err(err) = this.reclaim_expired().await {
                        error!(dispatcher = %this.id, error = %err, "lease sweep failed");
                    }
                }
            }));
        }

        DispatcherHandle { token, tasks }
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }

    async fn dispatch_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = wait_for(&self.signal) => {}
                _ = ticker.tick() => {}
            }

            // 满批说明可能还有积压，继续认领直到取不满
            while !token.is_cancelled() {
                match self.run_once().await {
                    Ok(report) if report.claimed >= self.config.batch_size => continue,
                    Ok(_) => break,
                    Err(err) => {
                        error!(dispatcher = %self.id, error = %err, "dispatch round failed");
                        break;
                    }
                }
            }
        }
    }
}

async fn wait_for(signal: &Option<DispatchSignal>) {
    match signal {
        Some(signal) => signal.notified().await,
        None => std::future::pending().await,
    }
}

fn lease_expired(record: &OutboxRecord, now: DateTime<Utc>) -> bool {
    record.lease_expires_at().is_some_and(|at| at <= now)
}

fn retry_time(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// 投递器运行句柄：用于优雅关闭与等待任务结束
pub struct DispatcherHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
