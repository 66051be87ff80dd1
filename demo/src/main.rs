use anyhow::Result as AnyResult;
use futures_util::StreamExt;
use outbox_core::aggregate::Aggregate;
use outbox_core::config::OutboxConfig;
use outbox_core::entity::Entity;
use outbox_core::error::{DomainError, DomainResult};
use outbox_core::eventing::{Dispatcher, EventBus, InMemoryEventBus, OutboxAdmin};
use outbox_core::persist::{
    InMemoryOutboxStore, OutboxStatus, OutboxStore, StateReader, TransactionalStore,
    load_aggregate,
};
use outbox_core::unit_of_work::{CommitPipeline, DispatchSignal};
use outbox_core::{aggregate_root, domain_event};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[aggregate_root(type = "order")]
#[derive(Clone)]
struct Order {
    items: Vec<String>,
    placed: bool,
    shipped: bool,
}

#[derive(Debug, thiserror::Error)]
enum OrderError {
    #[error("order already placed")]
    AlreadyPlaced,
    #[error("order has no items")]
    Empty,
    #[error("order not placed")]
    NotPlaced,
    #[error("order already shipped")]
    AlreadyShipped,
}

impl From<OrderError> for DomainError {
    fn from(err: OrderError) -> Self {
        DomainError::validation(err.to_string())
    }
}

#[domain_event]
enum OrderEvent {
    Placed { items: Vec<String> },
    Shipped {},
    #[event(event_type = "order.cancelled")]
    Cancelled { reason: String },
}

impl Order {
    fn place(&mut self, items: Vec<String>) -> DomainResult<()> {
        if self.placed {
            return Err(OrderError::AlreadyPlaced.into());
        }
        if items.is_empty() {
            return Err(OrderError::Empty.into());
        }
        self.items = items.clone();
        self.placed = true;
        self.raise(&OrderEvent::Placed { items })
    }

    fn ship(&mut self) -> DomainResult<()> {
        if !self.placed {
            return Err(OrderError::NotPlaced.into());
        }
        if self.shipped {
            return Err(OrderError::AlreadyShipped.into());
        }
        self.shipped = true;
        self.raise(&OrderEvent::Shipped {})
    }

    fn cancel(&mut self, reason: &str) -> DomainResult<()> {
        if self.shipped {
            return Err(OrderError::AlreadyShipped.into());
        }
        self.set_deleted(true);
        self.raise(&OrderEvent::Cancelled {
            reason: reason.to_string(),
        })
    }
}

struct Stores {
    tx: Arc<dyn TransactionalStore>,
    outbox: Arc<dyn OutboxStore>,
    reader: Arc<dyn StateReader>,
}

impl Stores {
    fn new<S>(store: S) -> Self
    where
        S: TransactionalStore + OutboxStore + StateReader + Clone + 'static,
    {
        Self {
            tx: Arc::new(store.clone()),
            outbox: Arc::new(store.clone()),
            reader: Arc::new(store),
        }
    }
}

#[cfg(feature = "postgres")]
async fn open_stores() -> AnyResult<Stores> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = outbox_core::persist::PgOutboxStore::connect(&url).await?;
            store.migrate().await?;
            info!("using postgres outbox store");
            Ok(Stores::new(store))
        }
        Err(_) => Ok(Stores::new(InMemoryOutboxStore::new())),
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_stores() -> AnyResult<Stores> {
    Ok(Stores::new(InMemoryOutboxStore::new()))
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // OUTBOX__DISPATCHER__BATCH_SIZE=50 之类的环境变量覆盖默认值
    let config = OutboxConfig::from_env()?;
    let stores = open_stores().await?;

    let signal = DispatchSignal::new();
    let pipeline = CommitPipeline::builder()
        .store(stores.tx.clone())
        .signal(signal.clone())
        .build();

    let bus = InMemoryEventBus::new(256);
    let mut deliveries = bus.subscribe().await;
    let consumer = tokio::spawn(async move {
        while let Some(next) = deliveries.next().await {
            match next {
                Ok(env) => info!(
                    aggregate_id = %env.aggregate_id,
                    sequence_number = env.sequence_number,
                    event_type = %env.event_type,
                    message_id = %env.message_id,
                    "delivered"
                ),
                Err(err) => tracing::warn!(error = %err, "consumer lagged"),
            }
        }
    });

    let dispatcher = Arc::new(
        Dispatcher::builder()
            .store(stores.outbox.clone())
            .transport(Arc::new(bus) as Arc<dyn EventBus>)
            .config(config.dispatcher.clone())
            .backoff(config.backoff.clone())
            .signal(signal)
            .id("demo-dispatcher")
            .build(),
    );
    let handle = dispatcher.start();

    // 下单 + 发货
    for n in 1..=3 {
        let mut order = Order::new(format!("order-{n}"));
        order.place(vec![format!("sku-{n}")])?;
        let mut uow = pipeline.unit_of_work();
        uow.register(&mut order);
        uow.commit().await?;

        let mut order: Order = load_aggregate(&*stores.reader, &format!("order-{n}"), false)
            .await?
            .ok_or_else(|| anyhow::anyhow!("order-{n} not found"))?;
        if n == 3 {
            order.cancel("customer request")?;
        } else {
            order.ship()?;
        }
        let mut uow = pipeline.unit_of_work();
        uow.register(&mut order);
        uow.commit().await?;
    }

    // 被业务规则拒绝的操作不产生任何记录
    let mut shipped: Order = load_aggregate(&*stores.reader, &"order-1".to_string(), false)
        .await?
        .ok_or_else(|| anyhow::anyhow!("order-1 not found"))?;
    if let Err(err) = shipped.ship() {
        info!(error = %err, "rejected");
    }

    let cancelled =
        load_aggregate::<Order, _>(&*stores.reader, &"order-3".to_string(), false).await?;
    info!(visible = cancelled.is_some(), "cancelled order lookup");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    handle.shutdown();
    handle.join().await;
    consumer.abort();

    let admin = OutboxAdmin::new(stores.outbox);
    let stats = admin.stats().await?;
    info!(
        dispatched = stats.get(OutboxStatus::Dispatched),
        pending = stats.get(OutboxStatus::Pending),
        dead_lettered = stats.get(OutboxStatus::DeadLettered),
        "outbox stats"
    );
    let purged = admin
        .purge_dispatched(chrono::Utc::now() - chrono::Duration::days(7))
        .await?;
    info!(purged, "retention sweep");
    Ok(())
}
