//! 总线配置
//!
//! 只覆盖运行时需要的最小集合：输入队列、重试策略、工作者数量、轮询间隔、
//! 关闭等待上限与定时存储后端选择。可由 serde 从任意格式反序列化，缺省字段取默认值。
//!
use crate::error::{BusError, BusResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 定时存储后端选择
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutBackend {
    /// 未显式提供存储时使用内存实现
    #[default]
    InMemory,
    /// 必须在构建引擎时提供外部存储（例如数据库实现）
    External,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 本地输入队列（`send_local`/`defer_local` 的目的地址）
    pub input_queue: String,
    pub retry: RetryPolicy,
    /// 并发轮询输入队列的工作者数量
    pub worker_count: usize,
    /// 队列为空时工作者的等待间隔
    pub idle_poll_interval: Duration,
    /// 到期定时条目的轮询间隔（决定延迟投递的最大额外延迟）
    pub due_timeouts_poll_interval: Duration,
    /// 优雅关闭时等待在途处理完成的上限
    pub shutdown_timeout: Duration,
    pub timeouts: TimeoutBackend,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            input_queue: "postbus-input".to_string(),
            retry: RetryPolicy::default(),
            worker_count: 1,
            idle_poll_interval: Duration::from_millis(50),
            due_timeouts_poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            timeouts: TimeoutBackend::InMemory,
        }
    }
}

impl BusConfig {
    pub fn new(input_queue: impl Into<String>) -> Self {
        Self {
            input_queue: input_queue.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.input_queue.trim().is_empty() {
            return Err(BusError::configuration("input queue name must not be empty"));
        }
        if self.retry.error_queue.trim().is_empty() {
            return Err(BusError::configuration("error queue name must not be empty"));
        }
        if self.retry.error_queue == self.input_queue {
            return Err(BusError::configuration(format!(
                "error queue must differ from input queue '{}'",
                self.input_queue
            )));
        }
        if self.retry.max_delivery_attempts == 0 {
            return Err(BusError::configuration(
                "max_delivery_attempts must be at least 1",
            ));
        }
        if self.retry.route_base_delay.is_zero()
            || self.retry.route_max_delay < self.retry.route_base_delay
        {
            return Err(BusError::configuration(
                "route_base_delay must be non-zero and not exceed route_max_delay",
            ));
        }
        if self.worker_count == 0 {
            return Err(BusError::configuration("worker_count must be at least 1"));
        }
        if self.idle_poll_interval.is_zero() || self.due_timeouts_poll_interval.is_zero() {
            return Err(BusError::configuration("poll intervals must be non-zero"));
        }
        Ok(())
    }
}
