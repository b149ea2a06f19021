//! 保留头（`postbus-*`）
//!
//! 结构性头在传输时由信封字段生成、接收时还原为字段；其余保留头
//! （错误详情、失败历史等）作为普通头随信封流转，便于在错误队列中检查。

pub const MESSAGE_ID: &str = "postbus-msg-id";
pub const MESSAGE_TYPE: &str = "postbus-msg-type";
pub const DESTINATION: &str = "postbus-destination";
pub const ATTEMPTS: &str = "postbus-attempts";
pub const SECOND_LEVEL_ATTEMPTS: &str = "postbus-2nd-level-attempts";
pub const SENT_AT: &str = "postbus-sent-time";
pub const CONTENT_TYPE: &str = "postbus-content-type";

pub const DEFERRED_UNTIL: &str = "postbus-deferred-until";
pub const ERROR_DETAILS: &str = "postbus-error-details";
pub const FAILURE_HISTORY: &str = "postbus-failure-history";
pub const SOURCE_QUEUE: &str = "postbus-source-queue";

pub const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";

/// 是否为保留头（调用方不得自行设置）
pub fn is_reserved(name: &str) -> bool {
    name.starts_with("postbus-")
}
