use outbox_core::aggregate::Aggregate;
use outbox_core::entity::Entity;
use outbox_macros::{aggregate_root, domain_event};

#[aggregate_root(type = "order")]
#[derive(Clone)]
struct Order {
    total: u64,
}

#[aggregate_root]
struct Invoice {
    number: String,
}

#[domain_event]
enum OrderEvent {
    Placed { total: u64 },
}

fn main() {
    let mut order = Order::new("o-1".to_string());
    order.total = 10;
    order.raise(&OrderEvent::Placed { total: 10 }).unwrap();

    assert_eq!(Order::TYPE, "order");
    assert_eq!(order.id(), "o-1");
    assert!(!order.is_deleted());
    assert_eq!(order.recorder().pending_events().len(), 1);

    // 克隆保留未提交的事件
    let cloned = order.clone();
    assert_eq!(cloned.recorder().pending_events().len(), 1);

    assert_eq!(Invoice::TYPE, "Invoice");
    let invoice = Invoice::new("i-1".to_string());
    assert!(invoice.number.is_empty());
}
