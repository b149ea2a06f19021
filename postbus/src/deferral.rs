//! 延迟投递（DeferralService）
//!
//! `defer` 计算到期时间并写入定时存储，只有写入成功才返回；
//! `dispatch_due` 由引擎的单个周期任务调用，把到期条目重新送入传输。
//!
use crate::clock::Clock;
use crate::envelope::{Envelope, headers};
use crate::error::{BusError, BusResult};
use crate::timeouts::{TimeoutEntry, TimeoutStore};
use crate::transport::Transport;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// 到期时间：相对延迟或绝对时刻
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DueTime {
    Delay(Duration),
    At(DateTime<Utc>),
}

impl From<Duration> for DueTime {
    fn from(value: Duration) -> Self {
        DueTime::Delay(value)
    }
}

impl From<DateTime<Utc>> for DueTime {
    fn from(value: DateTime<Utc>) -> Self {
        DueTime::At(value)
    }
}

impl DueTime {
    pub fn resolve(&self, now: DateTime<Utc>) -> BusResult<DateTime<Utc>> {
        match *self {
            DueTime::At(at) => Ok(at),
            DueTime::Delay(delay) => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .ok_or_else(|| {
                    BusError::configuration(format!("defer delay {delay:?} is out of range"))
                }),
        }
    }
}

pub struct DeferralService {
    store: Arc<dyn TimeoutStore>,
    clock: Arc<dyn Clock>,
}

impl DeferralService {
    pub fn new(store: Arc<dyn TimeoutStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// 写入定时存储，返回解析后的到期时间；存储失败时原样返回错误
    pub async fn defer(&self, due: DueTime, envelope: Envelope) -> BusResult<DateTime<Utc>> {
        let due_time = due.resolve(self.clock.now())?;
        let destination = envelope.destination().to_string();
        let envelope = envelope.with_header(
            headers::DEFERRED_UNTIL,
            due_time.to_rfc3339_opts(SecondsFormat::Millis, true),
        );

        debug!(
            message_id = envelope.message_id(),
            message_type = envelope.message_type(),
            destination = %destination,
            due_time = %due_time,
            "deferring message"
        );

        let entry = TimeoutEntry::builder()
            .due_time(due_time)
            .destination(destination)
            .envelope(envelope)
            .build();
        self.store.schedule(entry).await?;

        Ok(due_time)
    }

    /// 把当前到期的条目重新发送，返回成功发送的数量
    ///
    /// 发送失败的条目会被放回存储等待下一轮，保证不丢失。
    pub async fn dispatch_due(&self, transport: &dyn Transport) -> BusResult<usize> {
        let now = self.clock.now();
        let mut due = self.store.poll_due(now).await?;
        let mut sent = 0;

        while let Some(entry) = due.next().await {
            let destination = entry.destination().to_string();

            match transport.send(&destination, entry.envelope().clone()).await {
                Ok(()) => {
                    debug!(
                        message_id = entry.envelope().message_id(),
                        destination = %destination,
                        "due message sent"
                    );
                    sent += 1;
                }
                Err(err) => {
                    warn!(
                        timeout_id = entry.id(),
                        destination = %destination,
                        error = %err,
                        "failed to send due message, rescheduling"
                    );
                    let timeout_id = entry.id().to_string();
                    if let Err(err) = self.store.schedule(entry).await {
                        error!(
                            timeout_id = %timeout_id,
                            error = %err,
                            "failed to reschedule due message; it was not delivered"
                        );
                    }
                }
            }
        }

        Ok(sent)
    }
}
