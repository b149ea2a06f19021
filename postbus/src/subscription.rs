//! 订阅存储（SubscriptionStore）
//!
//! 发布/订阅以消息类型标签为主题：`publish` 把信封复制给主题下的每个订阅地址。
//!
use crate::error::BusResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn subscribe(&self, topic: &str, address: &str) -> BusResult<()>;

    async fn unsubscribe(&self, topic: &str, address: &str) -> BusResult<()>;

    /// 主题的订阅地址（按地址排序）
    async fn subscribers(&self, topic: &str) -> BusResult<Vec<String>>;
}

/// 内存订阅存储，克隆后共享同一份数据，可被同一网络上的多个总线使用
#[derive(Clone, Default)]
pub struct InMemorySubscriptionStore {
    topics: Arc<DashMap<String, BTreeSet<String>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn subscribe(&self, topic: &str, address: &str) -> BusResult<()> {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(address.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, address: &str) -> BusResult<()> {
        if let Some(mut set) = self.topics.get_mut(topic) {
            set.remove(address);
        }
        Ok(())
    }

    async fn subscribers(&self, topic: &str) -> BusResult<Vec<String>> {
        Ok(self
            .topics
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
