/// Outbox 投递（内存版）示例
/// 展示 聚合 -> 工作单元提交 -> 投递器 -> 进程内处理器 的闭环，以及处理器暂时失败后的退避重投
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use outbox_core::aggregate::Aggregate;
use outbox_core::config::{BackoffConfig, DispatcherConfig};
use outbox_core::domain_event::DeliveryEnvelope;
use outbox_core::entity::Entity;
use outbox_core::error::{DomainError, DomainResult};
use outbox_core::eventing::{
    Dispatcher, EventBus, EventHandler, HandledEventType, HandlerBus, IdempotentHandler,
    InMemoryProcessedMessages, OutboxAdmin,
};
use outbox_core::persist::{InMemoryOutboxStore, OutboxStatus, OutboxStore};
use outbox_core::unit_of_work::{CommitPipeline, DispatchSignal};
use outbox_core::{aggregate_root, domain_event};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ============================================================================
// 领域模型
// ============================================================================

#[aggregate_root(type = "account")]
struct Account {
    balance: i64,
}

#[domain_event]
enum AccountEvent {
    Opened { initial_balance: i64 },
    Deposited { amount: i64 },
    #[event(event_type = "account.withdrawn")]
    Withdrawn { amount: i64 },
}

impl Account {
    fn open(&mut self, initial_balance: i64) -> DomainResult<()> {
        self.balance = initial_balance;
        self.raise(&AccountEvent::Opened { initial_balance })
    }

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

// ============================================================================
// 处理器
// ============================================================================

struct AuditLog;

#[async_trait]
impl EventHandler for AuditLog {
    fn handler_name(&self) -> &str {
        "audit-log"
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::All
    }

    async fn handle(&self, envelope: &DeliveryEnvelope) -> DomainResult<()> {
        println!(
            "[audit] {}#{} {} {}",
            envelope.aggregate_id, envelope.sequence_number, envelope.event_type, envelope.payload
        );
        Ok(())
    }
}

/// 第一次处理取款时模拟下游不可用
struct RiskCheck {
    tripped: AtomicBool,
}

#[async_trait]
impl EventHandler for RiskCheck {
    fn handler_name(&self) -> &str {
        "risk-check"
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::One("account.withdrawn".into())
    }

    async fn handle(&self, envelope: &DeliveryEnvelope) -> DomainResult<()> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(DomainError::storage("risk service unavailable"));
        }
        println!("[risk] checked withdrawal {}", envelope.message_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outbox_core=info".into()),
        )
        .init();

    let store = InMemoryOutboxStore::new();
    let signal = DispatchSignal::new();
    let pipeline = CommitPipeline::builder()
        .store(Arc::new(store.clone()))
        .signal(signal.clone())
        .build();

    let processed = Arc::new(InMemoryProcessedMessages::new());
    let bus = HandlerBus::builder()
        .event_handlers(vec![
            Arc::new(IdempotentHandler::new(AuditLog, processed.clone())) as Arc<dyn EventHandler>,
            Arc::new(IdempotentHandler::new(
                RiskCheck {
                    tripped: AtomicBool::new(false),
                },
                processed,
            )) as Arc<dyn EventHandler>,
        ])
        .build();

    let dispatcher = Arc::new(
        Dispatcher::builder()
            .store(Arc::new(store.clone()) as Arc<dyn OutboxStore>)
            .transport(Arc::new(bus) as Arc<dyn EventBus>)
            .config(DispatcherConfig {
                poll_interval_ms: 50,
                ..Default::default()
            })
            .backoff(BackoffConfig {
                base_ms: 100,
                ..Default::default()
            })
            .signal(signal)
            .id("example-dispatcher")
            .build(),
    );
    let handle = dispatcher.start();

    // 一次提交：开户并存入
    let mut account = Account::new("acc-1".to_string());
    account.open(100)?;
    account.deposit(50)?;
    let mut uow = pipeline.unit_of_work();
    uow.register(&mut account);
    let receipt = uow.commit().await?;
    println!("committed {} records", receipt.len());

    // 第二次提交：取款（风控处理器首次失败，投递器退避后重投）
    account.withdraw(30)?;
    let mut uow = pipeline.unit_of_work();
    uow.register(&mut account);
    uow.commit().await?;

    tokio::time::sleep(Duration::from_millis(800)).await;
    handle.shutdown();
    handle.join().await;

    let stats = OutboxAdmin::new(Arc::new(store)).stats().await?;
    println!(
        "dispatched={} pending={} failed={} dead_lettered={}",
        stats.get(OutboxStatus::Dispatched),
        stats.get(OutboxStatus::Pending),
        stats.get(OutboxStatus::Failed),
        stats.get(OutboxStatus::DeadLettered),
    );
    Ok(())
}
