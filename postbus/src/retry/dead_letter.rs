use crate::envelope::{Envelope, TransportMessage, headers};
use crate::error::{BusError, BusResult};
use crate::retry::FailureRecord;

/// 错误队列中一条永久失败消息的检查视图
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub source_queue: String,
    pub error_details: String,
    pub failures: Vec<FailureRecord>,
}

impl DeadLetter {
    pub fn from_envelope(envelope: Envelope) -> BusResult<Self> {
        let source_queue = required(&envelope, headers::SOURCE_QUEUE)?;
        let error_details = required(&envelope, headers::ERROR_DETAILS)?;
        let failures = match envelope.header(headers::FAILURE_HISTORY) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            envelope,
            source_queue,
            error_details,
            failures,
        })
    }

    pub fn from_transport_message(message: TransportMessage) -> BusResult<Self> {
        Self::from_envelope(Envelope::from_transport_message(message)?)
    }
}

fn required(envelope: &Envelope, name: &str) -> BusResult<String> {
    envelope
        .header(name)
        .map(str::to_string)
        .ok_or_else(|| BusError::invalid_header(name, "missing on dead letter"))
}
