use postbus::{Message, message};

#[message(name = "billing.InvoiceIssued")]
#[derive(PartialEq)]
#[serde(rename_all = "camelCase")]
struct InvoiceIssued {
    invoice_no: String,
}

#[message(name = "billing.PaymentState")]
#[derive(Clone, serde::Serialize)]
enum PaymentState {
    Pending,
    Settled { at: String },
}

fn main() {
    assert_eq!(InvoiceIssued::TYPE, "billing.InvoiceIssued");
    assert_eq!(PaymentState::TYPE, "billing.PaymentState");

    // 已有 derive 与默认派生合并去重，#[serde] 辅助属性仍然可用
    let a = InvoiceIssued {
        invoice_no: "N-1".into(),
    };
    assert!(a == a.clone());

    let _ = format!("{:?}", PaymentState::Pending);
    let _ = PaymentState::Settled { at: "now".into() }.clone();
}
