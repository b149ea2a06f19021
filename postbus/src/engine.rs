//! 总线引擎（BusEngine）
//!
//! 统一编排总线的长驻任务：
//! - `worker_count` 个工作者轮询输入队列，逐条交给分发器；
//! - 单个周期任务把到期的延迟消息重新送入传输；
//! - 提供关闭与等待的 `BusHandle`，超时后把在途信封放回输入队列。
//!
use crate::bus::Bus;
use crate::clock::{Clock, SystemClock};
use crate::config::{BusConfig, TimeoutBackend};
use crate::deferral::DeferralService;
use crate::dispatcher::Dispatcher;
use crate::envelope::Envelope;
use crate::error::{BusError, BusResult};
use crate::handler::{HandlerRegistry, Services};
use crate::retry::RetryCoordinator;
use crate::subscription::{InMemorySubscriptionStore, SubscriptionStore};
use crate::timeouts::{InMemoryTimeoutStore, TimeoutStore};
use crate::transport::Transport;
use bon::Builder;
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::bus_engine_builder::{IsUnset, SetRegistry, State as BuilderState};

/// 工作者编号 → 正在处理的信封
type InFlight = Arc<DashMap<usize, Envelope>>;

/// BusEngine：
/// - 以注入的传输、定时存储、订阅存储与处理器注册表构建总线
/// - `start` 之后返回 `BusHandle`，注册表随之冻结
#[derive(Builder)]
pub struct BusEngine {
    #[builder(default)]
    config: BusConfig,
    transport: Arc<dyn Transport>,
    /// 未提供时按 `config.timeouts` 选择后端
    timeout_store: Option<Arc<dyn TimeoutStore>>,
    /// 未提供时使用进程内订阅存储
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    #[builder(default)]
    registry: HandlerRegistry,
    #[builder(default)]
    services: Services,
    clock: Option<Arc<dyn Clock>>,
}

impl<S: BuilderState> BusEngineBuilder<S> {
    /// 以闭包方式注册处理器
    pub fn handlers(
        self,
        register: impl FnOnce(&mut HandlerRegistry),
    ) -> BusEngineBuilder<SetRegistry<S>>
    where
        <S as BuilderState>::Registry: IsUnset,
    {
        let mut registry = HandlerRegistry::new();
        register(&mut registry);
        self.registry(registry)
    }
}

impl BusEngine {
    /// 校验配置、创建队列并启动后台任务
    pub async fn start(self) -> BusResult<BusHandle> {
        let BusEngine {
            config,
            transport,
            timeout_store,
            subscriptions,
            registry,
            services,
            clock,
        } = self;

        config.validate()?;

        let timeout_store: Arc<dyn TimeoutStore> = match (timeout_store, config.timeouts) {
            (Some(store), _) => store,
            (None, TimeoutBackend::InMemory) => Arc::new(InMemoryTimeoutStore::new()),
            (None, TimeoutBackend::External) => {
                return Err(BusError::configuration(
                    "timeout backend 'external' selected but no timeout store was provided",
                ));
            }
        };
        let subscriptions: Arc<dyn SubscriptionStore> = match subscriptions {
            Some(store) => store,
            None => Arc::new(InMemorySubscriptionStore::new()),
        };
        let clock: Arc<dyn Clock> = match clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        if registry.registered_types().is_empty() {
            warn!(
                input_queue = %config.input_queue,
                "no handlers registered; every received message will be dead-lettered"
            );
        }

        transport.create_queue(&config.input_queue).await?;
        transport.create_queue(&config.retry.error_queue).await?;

        let deferral = Arc::new(DeferralService::new(timeout_store, clock.clone()));
        let bus = Bus::new(
            config.input_queue.clone(),
            transport.clone(),
            deferral.clone(),
            subscriptions,
        );
        let coordinator = Arc::new(RetryCoordinator::new(
            config.retry.clone(),
            transport.clone(),
            clock,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            bus.clone(),
            Arc::new(registry),
            Arc::new(services),
            coordinator,
        ));

        let token = CancellationToken::new();
        let in_flight: InFlight = Arc::new(DashMap::new());
        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(config.worker_count);

        // 输入队列工作者（长循环）
        for worker_id in 0..config.worker_count {
            workers.push(tokio::spawn(worker_loop(Worker {
                id: worker_id,
                dispatcher: dispatcher.clone(),
                transport: transport.clone(),
                queue: config.input_queue.clone(),
                idle: config.idle_poll_interval,
                token: token.clone(),
                in_flight: in_flight.clone(),
            })));
        }

        // 到期定时条目（周期任务）
        let timer = {
            let deferral = deferral.clone();
            let transport = transport.clone();

            spawn_periodic(token.clone(), config.due_timeouts_poll_interval, move || {
                let deferral = deferral.clone();
                let transport = transport.clone();
                async move {
                    match deferral.dispatch_due(transport.as_ref()).await {
                        Ok(0) => {}
                        Ok(sent) => debug!(sent, "due messages dispatched"),
                        Err(err) => warn!(error = %err, "failed to poll due timeouts"),
                    }
                }
            })
        };

        info!(
            input_queue = %config.input_queue,
            workers = config.worker_count,
            "bus started"
        );

        Ok(BusHandle {
            bus,
            token,
            workers,
            timer: Some(timer),
            in_flight,
            transport,
            input_queue: config.input_queue,
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

struct Worker {
    id: usize,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    queue: String,
    idle: Duration,
    token: CancellationToken,
    in_flight: InFlight,
}

// 取消只在两次接收之间生效，已开始的处理会执行完毕
async fn worker_loop(worker: Worker) {
    while !worker.token.is_cancelled() {
        match worker.transport.receive(&worker.queue).await {
            Ok(Some(envelope)) => {
                let message_id = envelope.message_id().to_string();
                worker.in_flight.insert(worker.id, envelope.clone());
                let result = worker.dispatcher.process(envelope).await;
                worker.in_flight.remove(&worker.id);

                match result {
                    Ok(outcome) => debug!(
                        worker_id = worker.id,
                        message_id = %message_id,
                        ?outcome,
                        "processed"
                    ),
                    Err(err) => error!(
                        worker_id = worker.id,
                        message_id = %message_id,
                        error = %err,
                        "failed to route message after handling"
                    ),
                }
            }
            Ok(None) => idle(&worker).await,
            Err(err) => {
                warn!(worker_id = worker.id, error = %err, "receive failed");
                idle(&worker).await;
            }
        }
    }

    debug!(worker_id = worker.id, "worker stopped");
}

async fn idle(worker: &Worker) {
    tokio::select! {
        _ = worker.token.cancelled() => {}
        _ = time::sleep(worker.idle) => {}
    }
}

fn spawn_periodic<F, Fut>(token: CancellationToken, interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => f().await,
            }
        }
    })
}

/// 正常关闭的汇总
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 正常退出的工作者数量
    pub workers_stopped: usize,
}

/// 总线运行句柄：用于访问总线、优雅关闭与等待任务结束
pub struct BusHandle {
    bus: Bus,
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    in_flight: InFlight,
    transport: Arc<dyn Transport>,
    input_queue: String,
    shutdown_timeout: Duration,
}

impl BusHandle {
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// 发出停止信号，不等待
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 按配置的 `shutdown_timeout` 停止
    pub async fn stop(self) -> BusResult<ShutdownReport> {
        let timeout = self.shutdown_timeout;
        self.stop_within(timeout).await
    }

    /// 停止接收新消息并等待在途处理完成
    ///
    /// 超时后中止仍在运行的工作者，把它们手上的信封放回输入队列
    /// （至少一次投递），并返回 `ShutdownTimeout`。
    pub async fn stop_within(mut self, timeout: Duration) -> BusResult<ShutdownReport> {
        self.shutdown();

        let mut workers = std::mem::take(&mut self.workers);
        let mut timer = self.timer.take();

        // 定时任务只在两次轮询之间响应取消，正在送出的到期消息会先完成
        let drained = time::timeout(timeout, async {
            for handle in workers.iter_mut() {
                if let Err(err) = handle.await {
                    error!(error = %err, "worker task ended abnormally");
                }
            }
            if let Some(handle) = timer.as_mut() {
                if let Err(err) = handle.await {
                    error!(error = %err, "due-timeout task ended abnormally");
                }
            }
        })
        .await;

        if drained.is_ok() {
            info!(workers = workers.len(), "bus stopped");
            return Ok(ShutdownReport {
                workers_stopped: workers.len(),
            });
        }

        let abandoned = workers.iter().filter(|h| !h.is_finished()).count();
        for handle in &workers {
            handle.abort();
        }
        if let Some(handle) = timer.filter(|h| !h.is_finished()) {
            warn!("due-timeout task still running at shutdown deadline, aborting");
            handle.abort();
        }

        let stranded: Vec<Envelope> = self
            .in_flight
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.in_flight.clear();

        for envelope in stranded {
            let message_id = envelope.message_id().to_string();
            if let Err(err) = self.transport.send(&self.input_queue, envelope).await {
                error!(message_id = %message_id, error = %err, "failed to requeue in-flight message");
            }
        }

        error!(?timeout, abandoned, "bus shutdown timed out");
        Err(BusError::ShutdownTimeout { timeout, abandoned })
    }

    /// 等待全部后台任务结束（需先调用 `shutdown`）
    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.workers);

        for t in tasks.into_iter().chain(self.timer.take()) {
            if let Err(err) = t.await {
                error!(error = %err, "background task ended abnormally");
            }
        }
    }
}

impl Drop for BusHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
