//! 分发器（Dispatcher）
//!
//! 对一条收到的信封：按计数判定所处阶段 → 激活该类型的全部处理器 →
//! 把失败交给重试协调器决定重投、升级或移入错误队列。
//!
//! - 同一类型的多个处理器按注册顺序串行执行，首个失败即中止，整条信封重试；
//! - 处理器 panic 视为一次失败；
//! - 没有注册处理器属于配置错误，直接移入错误队列，不消耗重试。
//!
use crate::bus::Bus;
use crate::envelope::Envelope;
use crate::error::{BusError, BusResult};
use crate::handler::{HandlerContext, HandlerRegistry, Services};
use crate::retry::{RetryCoordinator, RetryDecision, RetryState};
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// 一次处理的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// 全部处理器成功
    Handled,
    /// 失败后已重新入队
    Redelivered,
    /// `Failed<M>` 处理器成功
    SecondLevelHandled,
    /// 二级派发失败后已重新入队
    SecondLevelRedelivered,
    /// 已移入错误队列
    DeadLettered,
}

pub struct Dispatcher {
    bus: Bus,
    registry: Arc<HandlerRegistry>,
    services: Arc<Services>,
    coordinator: Arc<RetryCoordinator>,
}

impl Dispatcher {
    pub fn new(
        bus: Bus,
        registry: Arc<HandlerRegistry>,
        services: Arc<Services>,
        coordinator: Arc<RetryCoordinator>,
    ) -> Self {
        Self {
            bus,
            registry,
            services,
            coordinator,
        }
    }

    /// 处理一条信封
    ///
    /// 处理器自身的失败总是被吸收进重试流程；重投或移入错误队列时传输
    /// 不可用会退避重试直至送达。返回 `Err` 只表示路由时出现不可重试的错误。
    #[instrument(
        skip_all,
        fields(
            message_id = envelope.message_id(),
            message_type = envelope.message_type(),
            attempts = envelope.attempts(),
        )
    )]
    pub async fn process(&self, envelope: Envelope) -> BusResult<ProcessOutcome> {
        match self.coordinator.state_of(&envelope) {
            RetryState::FirstLevelRetrying(_) => self.first_level(envelope).await,
            RetryState::SecondLevelDispatch(_) => self.second_level(envelope).await,
            RetryState::Exhausted => {
                // 上限被调低后到达的旧信封
                let reason = BusError::ExhaustedRetries {
                    message_id: envelope.message_id().to_string(),
                    attempts: envelope.attempts().max(envelope.second_level_attempts()),
                }
                .to_string();
                self.dead_letter(envelope, &reason).await
            }
        }
    }

    async fn first_level(&self, mut envelope: Envelope) -> BusResult<ProcessOutcome> {
        let handlers = self.registry.handlers_for(envelope.message_type());

        if handlers.is_empty() {
            let err = BusError::configuration(format!(
                "no handler registered for message type '{}'",
                envelope.message_type()
            ));
            error!(error = %err, "message cannot be dispatched");
            return self.dead_letter(envelope, &err.to_string()).await;
        }

        let ctx = self.context(&envelope);

        for registration in handlers {
            if let Err(failure) = run_guarded(&registration.name, (registration.invoke)(&ctx)).await {
                let (handler, reason) = failure_parts(failure);

                return match self.coordinator.on_failure(&mut envelope, &handler, &reason) {
                    RetryDecision::Redeliver => {
                        self.coordinator.redeliver(envelope).await?;
                        Ok(ProcessOutcome::Redelivered)
                    }
                    RetryDecision::EscalateToSecondLevel => self.second_level(envelope).await,
                    RetryDecision::DeadLetter { reason } => {
                        self.dead_letter(envelope, &reason).await
                    }
                };
            }
        }

        self.coordinator.on_success(&envelope);
        debug!(handlers = handlers.len(), "message handled");
        Ok(ProcessOutcome::Handled)
    }

    async fn second_level(&self, mut envelope: Envelope) -> BusResult<ProcessOutcome> {
        let handlers = self.registry.failed_handlers_for(envelope.message_type());

        if handlers.is_empty() {
            let last_error = self
                .coordinator
                .failures(envelope.message_id())
                .last()
                .map(|f| f.error.clone())
                .unwrap_or_default();
            let reason = format!(
                "no failed-message handler registered for message type '{}'; last error: {last_error}",
                envelope.message_type()
            );
            return self.dead_letter(envelope, &reason).await;
        }

        let attempt = envelope.second_level_attempts() + 1;
        let ctx = self.context(&envelope);

        for registration in handlers {
            let failures = self.coordinator.failures(envelope.message_id());
            let invocation = (registration.invoke)(&ctx, failures, attempt);

            if let Err(failure) = run_guarded(&registration.name, invocation).await {
                let (handler, reason) = failure_parts(failure);

                return match self
                    .coordinator
                    .on_second_level_failure(&mut envelope, &handler, &reason)
                {
                    RetryDecision::Redeliver | RetryDecision::EscalateToSecondLevel => {
                        self.coordinator.redeliver(envelope).await?;
                        Ok(ProcessOutcome::SecondLevelRedelivered)
                    }
                    RetryDecision::DeadLetter { reason } => {
                        self.dead_letter(envelope, &reason).await
                    }
                };
            }
        }

        self.coordinator.on_success(&envelope);
        debug!(attempt, "failed message handled");
        Ok(ProcessOutcome::SecondLevelHandled)
    }

    async fn dead_letter(&self, envelope: Envelope, reason: &str) -> BusResult<ProcessOutcome> {
        self.coordinator.dead_letter(envelope, reason).await?;
        Ok(ProcessOutcome::DeadLettered)
    }

    fn context(&self, envelope: &Envelope) -> HandlerContext {
        HandlerContext::new(
            self.bus.clone(),
            self.services.clone(),
            Arc::new(envelope.clone()),
        )
    }
}

// 执行一次处理器调用，把错误与 panic 统一为 HandlerFailure
async fn run_guarded<Fut>(handler: &str, invocation: Fut) -> BusResult<()>
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    let reason = match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => format!("{err:#}"),
        Err(panic) => format!("handler panicked: {}", panic_message(&*panic)),
    };

    Err(BusError::HandlerFailure {
        handler: handler.to_string(),
        reason,
    })
}

fn failure_parts(err: BusError) -> (String, String) {
    match err {
        BusError::HandlerFailure { handler, reason } => (handler, reason),
        other => (String::new(), other.to_string()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
