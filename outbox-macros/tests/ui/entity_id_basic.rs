use outbox_macros::entity_id;
use uuid::Uuid;

#[entity_id]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OrderId(Uuid);

fn main() {
    let raw = Uuid::new_v4();
    let id = OrderId::from(raw);

    let parsed: OrderId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert!("nope".parse::<OrderId>().is_err());

    let back: Uuid = id.into();
    assert_eq!(back, raw);
}
