use postbus::{Message, message};

#[message]
struct OrderPlaced {
    order_id: u64,
    customer: String,
}

#[message]
struct Ping;

#[message]
struct Amount(i64);

fn main() {
    // 默认类型标签取类型名
    assert_eq!(OrderPlaced::TYPE, "OrderPlaced");
    assert_eq!(Ping::TYPE, "Ping");
    assert_eq!(Amount::TYPE, "Amount");

    // Debug/Clone/Serialize/Deserialize 均已派生
    let order = OrderPlaced {
        order_id: 1,
        customer: "alice".into(),
    };
    let _ = format!("{:?}", order.clone());
    let _ = format!("{:?}", Amount(3).clone());
}
