//! 内存版定时存储
//!
//! 以 `(due_time, 插入序号)` 为键的有序表：同一时刻到期的条目保持插入顺序。
//! 进程退出后条目丢失，适用于测试与本地开发。
//!
use crate::error::BusResult;
use crate::timeouts::{TimeoutEntry, TimeoutStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

type Key = (DateTime<Utc>, u64);

#[derive(Default)]
struct Ledger {
    next_seq: u64,
    entries: BTreeMap<Key, TimeoutEntry>,
}

#[derive(Clone, Default)]
pub struct InMemoryTimeoutStore {
    ledger: Arc<Mutex<Ledger>>,
}

impl InMemoryTimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.ledger.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 最早的到期时间（不移除）
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.ledger
            .lock()
            .await
            .entries
            .keys()
            .next()
            .map(|(due, _)| *due)
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    async fn schedule(&self, entry: TimeoutEntry) -> BusResult<()> {
        let mut ledger = self.ledger.lock().await;
        let seq = ledger.next_seq;
        ledger.next_seq += 1;
        ledger.entries.insert((entry.due_time(), seq), entry);
        Ok(())
    }

    async fn poll_due(&self, now: DateTime<Utc>) -> BusResult<BoxStream<'static, TimeoutEntry>> {
        let due: Vec<TimeoutEntry> = {
            let mut ledger = self.ledger.lock().await;
            // split_off 保留 >= 边界的部分，边界之前即为到期条目
            let not_yet = ledger.entries.split_off(&(now, u64::MAX));
            let due = std::mem::replace(&mut ledger.entries, not_yet);
            due.into_values().collect()
        };

        Ok(Box::pin(tokio_stream::iter(due)))
    }
}
