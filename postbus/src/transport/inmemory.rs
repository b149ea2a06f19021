//! 内存版传输（InMemoryTransport）
//!
//! `InMemoryNetwork` 是一组按名称索引的 FIFO 队列，可被多个总线实例共享，
//! 用于测试、示例与本地开发。信封在入队时编码为 `TransportMessage`，
//! 出队时再解码，与真实传输一样经过序列化边界。
//!
use crate::envelope::{Envelope, TransportMessage};
use crate::error::BusResult;
use crate::transport::Transport;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// 共享的内存队列集合
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    queues: Arc<DashMap<String, VecDeque<TransportMessage>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_queue(&self, address: &str) {
        self.queues.entry(address.to_string()).or_default();
    }

    pub fn deliver(&self, address: &str, message: TransportMessage) {
        self.queues
            .entry(address.to_string())
            .or_default()
            .push_back(message);
    }

    /// 出队：分片写锁内完成 pop，保证同一条消息只交给一个调用方
    pub fn take(&self, address: &str) -> Option<TransportMessage> {
        self.queues.get_mut(address)?.pop_front()
    }

    pub fn queue_len(&self, address: &str) -> usize {
        self.queues.get(address).map(|q| q.len()).unwrap_or(0)
    }

    pub fn has_queue(&self, address: &str) -> bool {
        self.queues.contains_key(address)
    }

    /// 取出某队列的全部消息（错误队列检查）
    pub fn drain(&self, address: &str) -> Vec<TransportMessage> {
        match self.queues.get_mut(address) {
            Some(mut q) => q.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

/// 基于 `InMemoryNetwork` 的传输实现
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    pub fn new(network: InMemoryNetwork) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn create_queue(&self, address: &str) -> BusResult<()> {
        self.network.create_queue(address);
        Ok(())
    }

    async fn send(&self, address: &str, envelope: Envelope) -> BusResult<()> {
        let message = envelope.to_transport_message()?;
        self.network.deliver(address, message);
        Ok(())
    }

    async fn receive(&self, address: &str) -> BusResult<Option<Envelope>> {
        match self.network.take(address) {
            Some(message) => Ok(Some(Envelope::from_transport_message(message)?)),
            None => Ok(None),
        }
    }
}
