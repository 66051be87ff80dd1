use outbox_core::domain_event::EventPayload;
use outbox_macros::domain_event;

#[domain_event]
enum ShipmentEvent {
    Dispatched { carrier: String },
    #[event(event_type = "shipment.delivered")]
    Delivered {},
    Cancelled,
    Delayed(u32),
}

// 已有派生不会重复
#[domain_event]
#[derive(Debug, Clone)]
enum BankEvent {
    #[event(event_type = "bank.opened")]
    Opened { name: String },
}

fn main() {
    let ev = ShipmentEvent::Dispatched {
        carrier: "dhl".into(),
    };
    assert_eq!(ev.event_type(), "ShipmentEvent.Dispatched");
    assert_eq!(ShipmentEvent::Delivered {}.event_type(), "shipment.delivered");
    assert_eq!(ShipmentEvent::Cancelled.event_type(), "ShipmentEvent.Cancelled");
    assert_eq!(ShipmentEvent::Delayed(3).event_type(), "ShipmentEvent.Delayed");
    assert_eq!(ev.clone(), ev);

    let opened = BankEvent::Opened { name: "n".into() };
    assert_eq!(opened.event_type(), "bank.opened");
}
