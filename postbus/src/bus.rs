//! 总线门面（Bus）
//!
//! 应用代码与处理器共用的入口：send / publish / defer / subscribe。
//! `Bus` 可廉价克隆，内部不持有任何跨 await 的锁，因此处理器可以在
//! 被分发期间重入调用同一个总线。
//!
use crate::deferral::{DeferralService, DueTime};
use crate::envelope::{Envelope, headers};
use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::subscription::SubscriptionStore;
use crate::transport::Transport;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    input_queue: String,
    transport: Arc<dyn Transport>,
    deferral: Arc<DeferralService>,
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("input_queue", &self.inner.input_queue)
            .finish_non_exhaustive()
    }
}

impl Bus {
    pub(crate) fn new(
        input_queue: impl Into<String>,
        transport: Arc<dyn Transport>,
        deferral: Arc<DeferralService>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                input_queue: input_queue.into(),
                transport,
                deferral,
                subscriptions,
            }),
        }
    }

    /// 本总线的输入队列
    pub fn input_queue(&self) -> &str {
        &self.inner.input_queue
    }

    /// 发送到本地输入队列，返回消息 ID
    #[instrument(skip_all, fields(message_type = M::TYPE))]
    pub async fn send_local<M: Message>(&self, message: &M) -> BusResult<String> {
        let envelope = Envelope::new(self.input_queue(), message)?;
        self.dispatch(envelope).await
    }

    /// 发送到指定队列，返回消息 ID
    #[instrument(skip_all, fields(message_type = M::TYPE, destination = %destination))]
    pub async fn send<M: Message>(&self, destination: &str, message: &M) -> BusResult<String> {
        let envelope = Envelope::new(destination, message)?;
        self.dispatch(envelope).await
    }

    /// 携带自定义头发送；`postbus-` 前缀的保留头不允许由调用方设置
    #[instrument(skip_all, fields(message_type = M::TYPE, destination = %destination))]
    pub async fn send_with_headers<M: Message>(
        &self,
        destination: &str,
        message: &M,
        custom_headers: HashMap<String, String>,
    ) -> BusResult<String> {
        if let Some(name) = custom_headers
            .keys()
            .find(|name| headers::is_reserved(name))
        {
            return Err(BusError::invalid_header(
                name.clone(),
                "reserved for delivery metadata",
            ));
        }

        let envelope = Envelope::new(destination, message)?.with_headers(custom_headers);
        self.dispatch(envelope).await
    }

    /// 发布给该消息类型的全部订阅者；没有订阅者时不发送任何内容
    ///
    /// 所有副本共享同一个消息 ID。
    #[instrument(skip_all, fields(message_type = M::TYPE))]
    pub async fn publish<M: Message>(&self, message: &M) -> BusResult<String> {
        let envelope = Envelope::new(self.input_queue(), message)?;
        let subscribers = self.inner.subscriptions.subscribers(M::TYPE).await?;

        if subscribers.is_empty() {
            debug!(message_id = envelope.message_id(), "no subscribers, nothing published");
        }

        for address in &subscribers {
            self.inner
                .transport
                .send(address, envelope.with_destination(address.as_str()))
                .await?;
        }

        debug!(
            message_id = envelope.message_id(),
            subscribers = subscribers.len(),
            "message published"
        );
        Ok(envelope.message_id().to_string())
    }

    /// 延迟发送到本地输入队列
    ///
    /// 只有在定时存储确认写入后才返回；存储不可用时直接返回错误。
    #[instrument(skip_all, fields(message_type = M::TYPE))]
    pub async fn defer_local<M: Message>(
        &self,
        due: impl Into<DueTime>,
        message: &M,
    ) -> BusResult<String> {
        let destination = self.inner.input_queue.clone();
        self.defer(&destination, due, message).await
    }

    /// 延迟发送到指定队列
    #[instrument(skip_all, fields(message_type = M::TYPE, destination = %destination))]
    pub async fn defer<M: Message>(
        &self,
        destination: &str,
        due: impl Into<DueTime>,
        message: &M,
    ) -> BusResult<String> {
        let envelope = Envelope::new(destination, message)?;
        let message_id = envelope.message_id().to_string();
        self.inner.deferral.defer(due.into(), envelope).await?;
        Ok(message_id)
    }

    /// 把本总线的输入队列登记为该消息类型的订阅者
    pub async fn subscribe<M: Message>(&self) -> BusResult<()> {
        self.inner
            .subscriptions
            .subscribe(M::TYPE, self.input_queue())
            .await
    }

    pub async fn unsubscribe<M: Message>(&self) -> BusResult<()> {
        self.inner
            .subscriptions
            .unsubscribe(M::TYPE, self.input_queue())
            .await
    }

    async fn dispatch(&self, envelope: Envelope) -> BusResult<String> {
        let message_id = envelope.message_id().to_string();
        let destination = envelope.destination().to_string();
        self.inner.transport.send(&destination, envelope).await?;
        debug!(message_id = %message_id, destination = %destination, "message sent");
        Ok(message_id)
    }
}
