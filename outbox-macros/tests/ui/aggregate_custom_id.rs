use outbox_core::aggregate::Aggregate;
use outbox_core::entity::Entity;
use outbox_macros::{aggregate_root, entity_id};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[entity_id]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TicketId(Uuid);

#[aggregate_root(type = "ticket", id = TicketId)]
struct Ticket {
    title: String,
}

fn main() {
    let raw = Uuid::new_v4();
    let mut ticket = Ticket::new(TicketId::from(raw));
    ticket.set_deleted(true);

    assert!(ticket.is_deleted());
    assert_eq!(ticket.id().to_string(), raw.to_string());
    assert!(ticket.title.is_empty());
    assert_eq!(Ticket::TYPE, "ticket");
}
