use anyhow::Result;
use async_trait::async_trait;
use postbus::transport::InMemoryTransport;
use postbus::{
    Bus, BusConfig, BusEngine, Failed, Handle, HandlerContext, RetryPolicy, Services, message,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

#[message(name = "demo.MyMessage")]
struct MyMessage {
    text: String,
}

#[message(name = "demo.Reminder")]
struct Reminder {
    text: String,
}

#[derive(Default)]
struct Counters {
    handled: AtomicUsize,
    failed: AtomicUsize,
    deferred_once: AtomicBool,
}

struct AlwaysFails {
    counters: Arc<Counters>,
}

#[async_trait]
impl Handle<MyMessage> for AlwaysFails {
    async fn handle(&self, message: MyMessage) -> anyhow::Result<()> {
        let n = self.counters.handled.fetch_add(1, Ordering::SeqCst) + 1;
        info!(n, text = %message.text, "MyMessage handler invoked");
        anyhow::bail!("MyMessage handler always fails")
    }
}

struct RedeferOnce {
    bus: Bus,
    counters: Arc<Counters>,
}

#[async_trait]
impl Handle<Failed<MyMessage>> for RedeferOnce {
    async fn handle(&self, failed: Failed<MyMessage>) -> anyhow::Result<()> {
        let n = self.counters.failed.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            n,
            bus = ?self.bus,
            error = failed.error_description(),
            "failed-message handler invoked"
        );

        if !self.counters.deferred_once.swap(true, Ordering::SeqCst) {
            self.bus
                .defer_local(Duration::from_secs(1), failed.message())
                .await?;
            info!("original message deferred by 1 second");
        }
        Ok(())
    }
}

async fn on_reminder(reminder: Reminder, ctx: HandlerContext) -> anyhow::Result<()> {
    ctx.service::<Counters>()?
        .handled
        .fetch_add(1, Ordering::SeqCst);
    info!(text = %reminder.text, "reminder received");
    Ok(())
}

fn config(input_queue: &str, retry: RetryPolicy) -> BusConfig {
    BusConfig {
        retry,
        due_timeouts_poll_interval: Duration::from_millis(100),
        ..BusConfig::new(input_queue)
    }
}

/// 失败消息升级到二级处理，处理器通过注入的总线重新延迟原始消息
async fn failed_message_with_bus_injection() -> Result<()> {
    let counters = Arc::new(Counters::default());
    let retry = RetryPolicy {
        max_delivery_attempts: 2,
        second_level_retries_enabled: true,
        ..RetryPolicy::default()
    };

    let handle = BusEngine::builder()
        .config(config("demo-failed", retry))
        .transport(Arc::new(InMemoryTransport::default()))
        .services(Services::new().with_shared(counters.clone()))
        .handlers(|r| {
            r.register::<MyMessage, _, _>(|ctx: &HandlerContext| {
                Ok(AlwaysFails {
                    counters: ctx.service::<Counters>()?,
                })
            });
            r.register_failed::<MyMessage, _, _>(|ctx: &HandlerContext| {
                Ok(RedeferOnce {
                    bus: ctx.bus().clone(),
                    counters: ctx.service::<Counters>()?,
                })
            });
        })
        .build()
        .start()
        .await?;

    handle
        .bus()
        .send_local(&MyMessage {
            text: "hello".into(),
        })
        .await?;

    tokio::time::sleep(Duration::from_secs(3)).await;
    handle.stop().await?;

    info!(
        handled = counters.handled.load(Ordering::SeqCst),
        failed = counters.failed.load(Ordering::SeqCst),
        "scenario finished (expected handled=4, failed=2)"
    );
    Ok(())
}

/// 两小时的延迟消息在 5 秒的运行窗口内不会被投递
async fn long_deferral() -> Result<()> {
    let counters = Arc::new(Counters::default());

    let handle = BusEngine::builder()
        .config(config("demo-deferral", RetryPolicy::default()))
        .transport(Arc::new(InMemoryTransport::default()))
        .services(Services::new().with_shared(counters.clone()))
        .handlers(|r| {
            r.register_fn(on_reminder);
        })
        .build()
        .start()
        .await?;

    handle
        .bus()
        .defer_local(
            Duration::from_secs(2 * 60 * 60),
            &Reminder {
                text: "two hours later".into(),
            },
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.stop().await?;

    info!(
        received = counters.handled.load(Ordering::SeqCst),
        "scenario finished (expected received=0)"
    );
    Ok(())
}

/// 按环境变量（`RUST_LOG`）初始化日志，缺省为 info
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,postbus=debug"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    failed_message_with_bus_injection().await?;
    long_deferral().await?;

    Ok(())
}
