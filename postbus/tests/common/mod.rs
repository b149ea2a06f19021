#![allow(dead_code)]

use postbus::BusConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,postbus=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// 短轮询间隔的配置，缩短测试耗时
pub fn fast_config(input_queue: &str) -> BusConfig {
    BusConfig {
        idle_poll_interval: Duration::from_millis(5),
        due_timeouts_poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..BusConfig::new(input_queue)
    }
}

/// 处理器调用计数，通过 `Services` 注入
#[derive(Default)]
pub struct Tally {
    handled: AtomicUsize,
    failed: AtomicUsize,
    changed: Notify,
}

impl Tally {
    pub fn hit_handled(&self) -> usize {
        let n = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
        self.changed.notify_waiters();
        n
    }

    pub fn hit_failed(&self) -> usize {
        let n = self.failed.fetch_add(1, Ordering::SeqCst) + 1;
        self.changed.notify_waiters();
        n
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// 等待条件成立，超时返回 false
    pub async fn wait_for(&self, within: Duration, cond: impl Fn(&Tally) -> bool) -> bool {
        tokio::time::timeout(within, async {
            loop {
                let notified = self.changed.notified();
                if cond(self) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}
