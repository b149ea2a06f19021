//! 处理器（Handler）与激活上下文
//!
//! 处理器按消息逐条构造：分发器调用注册时提供的工厂，传入携带
//! 完整可用总线（`Bus`）与外部服务（`Services`）的 `HandlerContext`。
//! 处理器在执行期间可以通过同一个总线继续 send/publish/defer。
//!
mod registry;

pub use registry::HandlerRegistry;
pub(crate) use registry::{FailedInvokeFn, InvokeFn, Registration};

use crate::bus::Bus;
use crate::envelope::Envelope;
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

/// 处理某一类消息（或 `Failed<M>`）
#[async_trait]
pub trait Handle<M>: Send + Sync
where
    M: Send + 'static,
{
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

/// 启动时注入、供处理器工厂取用的外部服务（类型映射，只读）
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.with_shared(Arc::new(value))
    }

    /// 注入调用方也持有的共享实例（例如观测结果的通道或计数器）
    pub fn with_shared<T: Send + Sync + 'static>(mut self, value: Arc<T>) -> Self {
        self.entries.insert(TypeId::of::<T>(), value);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> BusResult<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
            .ok_or_else(|| BusError::ServiceNotRegistered {
                service: type_name::<T>(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 一次处理器激活的上下文
#[derive(Clone)]
pub struct HandlerContext {
    bus: Bus,
    services: Arc<Services>,
    envelope: Arc<Envelope>,
}

impl HandlerContext {
    pub(crate) fn new(bus: Bus, services: Arc<Services>, envelope: Arc<Envelope>) -> Self {
        Self {
            bus,
            services,
            envelope,
        }
    }

    /// 正在分发本消息的总线
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn service<T: Send + Sync + 'static>(&self) -> BusResult<Arc<T>> {
        self.services.get::<T>()
    }

    pub fn message_id(&self) -> &str {
        self.envelope.message_id()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        self.envelope.headers()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}
