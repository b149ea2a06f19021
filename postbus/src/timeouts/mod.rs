//! 定时存储（TimeoutStore）协议
//!
//! 记录“在时间 T 把信封 E 投递到地址 A”的账本：
//! - `schedule`：持久记录后返回，调用方在返回前不得假定延迟投递已生效；
//! - `poll_due`：返回全部到期（due_time <= now）条目并在同一操作中移除，
//!   同一条目不会被返回两次。
//!
//! 持久化实现需保证进程重启后条目仍在；内存实现只需保证按到期时间有序。
//!
mod inmemory;

pub use inmemory::InMemoryTimeoutStore;

use crate::envelope::Envelope;
use crate::error::BusResult;
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 定时条目
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct TimeoutEntry {
    #[builder(into, default = Uuid::new_v4().to_string())]
    id: String,
    /// 到期时间（UTC）
    due_time: DateTime<Utc>,
    /// 到期后投递的目的地址
    #[builder(into)]
    destination: String,
    envelope: Envelope,
}

impl TimeoutEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn due_time(&self) -> DateTime<Utc> {
        self.due_time
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_time <= now
    }
}

#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// 记录条目；后端不可达时返回 `StoreUnavailable`
    async fn schedule(&self, entry: TimeoutEntry) -> BusResult<()>;

    /// 取出全部到期条目（按到期时间升序），取出即移除
    async fn poll_due(&self, now: DateTime<Utc>) -> BusResult<BoxStream<'static, TimeoutEntry>>;
}
