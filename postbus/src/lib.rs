//! 消息总线运行时（postbus）
//!
//! 面向“至少一次投递”的进程内/跨进程消息总线，提供：
//! - 点对点发送（`Bus::send*`）与基于订阅的发布（`Bus::publish`）
//! - 延迟投递（`Bus::defer*`）：定时存储持久记录，到期后重新送入传输
//! - 重试与失败升级：一级立即重投，耗尽后可派发 `Failed<M>` 做二级处理，
//!   最终移入错误队列并附带完整失败上下文
//! - 处理器按消息激活，执行期间可以重入调用同一个总线
//!
//! 传输（`transport`）、定时存储（`timeouts`）与订阅存储（`subscription`）均为
//! 可替换的协议，内置内存实现用于测试与本地开发。
//!
//! 典型用法：
//! 1. 用 `#[message]` 定义消息类型；
//! 2. 在 `HandlerRegistry` 中注册处理器工厂或闭包；
//! 3. 通过 `BusEngine::builder()` 注入传输与服务并 `start`；
//! 4. 使用 `BusHandle::bus()` 发送消息，结束时 `stop`。
//!
pub mod bus;
pub mod clock;
pub mod config;
pub mod deferral;
pub mod dispatcher;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod message;
pub mod retry;
pub mod subscription;
pub mod timeouts;
pub mod transport;

pub use bus::Bus;
pub use config::{BusConfig, TimeoutBackend};
pub use deferral::DueTime;
pub use engine::{BusEngine, BusHandle, ShutdownReport};
pub use envelope::Envelope;
pub use error::{BusError, BusResult};
pub use handler::{Handle, HandlerContext, HandlerRegistry, Services};
pub use message::{Failed, Message};
pub use retry::{DeadLetter, FailureRecord, RetryPolicy};

#[cfg(feature = "macros")]
pub use postbus_macros::message;

// 允许在本 crate 内部通过 ::postbus 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::postbus 路径。
extern crate self as postbus;
