//! 传输（Transport）协议
//!
//! 在逻辑地址（队列名）之间收发信封：
//! - `send`：入队，至少一次语义，不按消息 ID 去重；
//! - `receive`：非阻塞轮询，按 FIFO 取出下一条，取出与移交是同一个原子动作，
//!   并发轮询同一地址时不会有两个调用方拿到同一条信封。
//!
mod inmemory;

pub use inmemory::{InMemoryNetwork, InMemoryTransport};

use crate::envelope::Envelope;
use crate::error::BusResult;
use async_trait::async_trait;

#[async_trait]
pub trait Transport: Send + Sync {
    /// 确保队列存在（幂等）
    async fn create_queue(&self, address: &str) -> BusResult<()>;

    /// 投递到指定地址；失败时返回 `TransportUnavailable`
    async fn send(&self, address: &str, envelope: Envelope) -> BusResult<()>;

    /// 取出该地址的下一条信封，没有待处理消息时返回 `None`
    async fn receive(&self, address: &str) -> BusResult<Option<Envelope>>;
}
