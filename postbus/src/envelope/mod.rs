//! 消息信封（Envelope）
//!
//! 信封 = 消息体 + 投递元数据（ID、目的地址、头、投递次数）。
//! 在 send/publish/defer 时创建；之后只允许递增投递计数，
//! 在成功处理或移入错误队列后结束生命周期。
//!
pub mod headers;
mod transport_message;

pub use transport_message::TransportMessage;

use crate::error::{BusError, BusResult};
use crate::message::Message;
use bon::Builder;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct Envelope {
    /// 消息唯一标识
    #[builder(into, default = Uuid::new_v4().to_string())]
    message_id: String,
    /// 消息类型标签（`Message::TYPE`）
    #[builder(into)]
    message_type: String,
    /// 目的地址（队列名）
    #[builder(into)]
    destination: String,
    /// 用户头
    #[builder(default)]
    headers: HashMap<String, String>,
    /// 一级投递已记录的失败次数
    #[builder(default)]
    attempts: u32,
    /// 二级派发已记录的失败次数
    #[builder(default)]
    second_level_attempts: u32,
    /// 发送时间
    #[builder(default = Utc::now())]
    sent_at: DateTime<Utc>,
    /// 消息体（JSON）
    body: Value,
}

impl Envelope {
    pub fn new<M: Message>(destination: impl Into<String>, message: &M) -> BusResult<Self> {
        Ok(Envelope::builder()
            .message_type(M::TYPE)
            .destination(destination)
            .body(serde_json::to_value(message)?)
            .build())
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn second_level_attempts(&self) -> u32 {
        self.second_level_attempts
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// 将消息体还原为具体消息类型，类型标签不一致时返回 `TypeMismatch`
    pub fn decode<M: Message>(&self) -> BusResult<M> {
        if self.message_type != M::TYPE {
            return Err(BusError::TypeMismatch {
                expected: M::TYPE.to_string(),
                found: self.message_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.body.clone())?)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// 复制到另一个目的地址（消息 ID 不变，用于发布给多个订阅者）
    pub fn with_destination(&self, destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..self.clone()
        }
    }

    /// 记录一次一级投递失败，返回记录后的次数
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// 记录一次二级派发失败，返回记录后的次数
    pub fn record_second_level_attempt(&mut self) -> u32 {
        self.second_level_attempts = self.second_level_attempts.saturating_add(1);
        self.second_level_attempts
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.headers
    }

    /// 编码为传输形态：用户头 + 结构性保留头 + JSON 载荷
    pub fn to_transport_message(&self) -> BusResult<TransportMessage> {
        let mut map = self.headers.clone();
        map.insert(headers::MESSAGE_ID.into(), self.message_id.clone());
        map.insert(headers::MESSAGE_TYPE.into(), self.message_type.clone());
        map.insert(headers::DESTINATION.into(), self.destination.clone());
        map.insert(headers::ATTEMPTS.into(), self.attempts.to_string());
        map.insert(
            headers::SECOND_LEVEL_ATTEMPTS.into(),
            self.second_level_attempts.to_string(),
        );
        map.insert(
            headers::SENT_AT.into(),
            self.sent_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        map.insert(
            headers::CONTENT_TYPE.into(),
            headers::JSON_CONTENT_TYPE.into(),
        );

        Ok(TransportMessage::new(map, serde_json::to_vec(&self.body)?))
    }

    /// 从传输形态还原信封
    pub fn from_transport_message(message: TransportMessage) -> BusResult<Self> {
        let TransportMessage {
            headers: mut map,
            body,
        } = message;

        let message_id = take_required(&mut map, headers::MESSAGE_ID)?;
        let message_type = take_required(&mut map, headers::MESSAGE_TYPE)?;
        let destination = take_required(&mut map, headers::DESTINATION)?;
        let attempts = take_counter(&mut map, headers::ATTEMPTS)?;
        let second_level_attempts = take_counter(&mut map, headers::SECOND_LEVEL_ATTEMPTS)?;

        let sent_at = take_required(&mut map, headers::SENT_AT)?;
        let sent_at = DateTime::parse_from_rfc3339(&sent_at)
            .map_err(|e| BusError::invalid_header(headers::SENT_AT, e.to_string()))?
            .with_timezone(&Utc);

        if let Some(content_type) = map.remove(headers::CONTENT_TYPE) {
            if content_type != headers::JSON_CONTENT_TYPE {
                return Err(BusError::invalid_header(
                    headers::CONTENT_TYPE,
                    format!("unsupported content type '{content_type}'"),
                ));
            }
        }

        let body: Value = serde_json::from_slice(&body)?;

        Ok(Envelope {
            message_id,
            message_type,
            destination,
            headers: map,
            attempts,
            second_level_attempts,
            sent_at,
            body,
        })
    }
}

fn take_required(map: &mut HashMap<String, String>, name: &str) -> BusResult<String> {
    map.remove(name).ok_or_else(|| BusError::invalid_header(name, "missing"))
}

// 计数头缺失视为 0（兼容未经本库发送的消息）
fn take_counter(map: &mut HashMap<String, String>, name: &str) -> BusResult<u32> {
    match map.remove(name) {
        None => Ok(0),
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|e| BusError::invalid_header(name, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
        customer: String,
    }

    impl Message for OrderPlaced {
        const TYPE: &'static str = "orders.OrderPlaced";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other;

    impl Message for Other {
        const TYPE: &'static str = "Other";
    }

    fn order() -> OrderPlaced {
        OrderPlaced {
            order_id: 7,
            customer: "alice".into(),
        }
    }

    #[test]
    fn transport_form_keeps_identity_destination_and_headers() {
        let mut env = Envelope::new("orders", &order())
            .unwrap()
            .with_header("tenant", "t-1")
            .with_header(headers::DEFERRED_UNTIL, "2030-01-01T00:00:00Z");
        env.record_attempt();

        let wire = env.to_transport_message().unwrap();
        assert_eq!(wire.header(headers::MESSAGE_ID), Some(env.message_id()));
        assert_eq!(wire.header(headers::ATTEMPTS), Some("1"));

        let back = Envelope::from_transport_message(wire).unwrap();
        assert_eq!(back, env);
        assert!(back.header(headers::MESSAGE_ID).is_none());
        assert_eq!(back.header("tenant"), Some("t-1"));
        assert_eq!(back.decode::<OrderPlaced>().unwrap(), order());
    }

    #[test]
    fn missing_message_id_is_rejected() {
        let env = Envelope::new("orders", &order()).unwrap();
        let mut wire = env.to_transport_message().unwrap();
        wire.headers.remove(headers::MESSAGE_ID);

        let err = Envelope::from_transport_message(wire).unwrap_err();
        assert!(matches!(err, BusError::InvalidHeader { ref header, .. } if header == headers::MESSAGE_ID));
    }

    #[test]
    fn garbage_counter_is_rejected() {
        let env = Envelope::new("orders", &order()).unwrap();
        let mut wire = env.to_transport_message().unwrap();
        wire.headers
            .insert(headers::ATTEMPTS.to_string(), "many".to_string());

        assert!(Envelope::from_transport_message(wire).is_err());
    }

    #[test]
    fn decode_checks_type_tag() {
        let env = Envelope::new("orders", &order()).unwrap();
        let err = env.decode::<Other>().unwrap_err();
        assert!(matches!(err, BusError::TypeMismatch { .. }));
    }

    #[test]
    fn counters_only_move_forward() {
        let mut env = Envelope::new("orders", &order()).unwrap();
        assert_eq!(env.attempts(), 0);
        assert_eq!(env.record_attempt(), 1);
        assert_eq!(env.record_attempt(), 2);
        assert_eq!(env.record_second_level_attempt(), 1);
        assert_eq!(env.attempts(), 2);
    }

    #[test]
    fn copies_for_other_destinations_share_the_message_id() {
        let env = Envelope::new("a", &order()).unwrap();
        let copy = env.with_destination("b");
        assert_eq!(copy.message_id(), env.message_id());
        assert_eq!(copy.destination(), "b");
        assert_eq!(env.destination(), "a");
    }
}
