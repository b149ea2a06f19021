//! 重试协调（RetryCoordinator）
//!
//! 按信封维护投递状态机：
//! - `FirstLevelRetrying(n)`：已失败 n 次，n < 上限时立即重新入队；
//! - `SecondLevelDispatch(n)`：一级次数耗尽且开启二级重试，派发 `Failed<M>`，
//!   二级失败同样受上限约束；
//! - `Exhausted`：移入错误队列，不再自动重试。
//!
//! 计数随信封流转，只由当前持有该信封的工作者修改；失败历史按消息 ID 记录，
//! 在成功或进入错误队列时清除。
//!
//! 重投与移入错误队列在传输不可用时按指数退避重试，信封不会被丢弃。
//!
mod dead_letter;

pub use dead_letter::DeadLetter;

use crate::clock::Clock;
use crate::envelope::{Envelope, headers};
use crate::error::{BusError, BusResult};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// 重试策略
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大投递次数（含首次），一级与二级各自适用
    pub max_delivery_attempts: u32,
    /// 一级耗尽后是否派发 `Failed<M>`
    pub second_level_retries_enabled: bool,
    /// 永久失败信封的去处
    pub error_queue: String,
    /// 重投或移入错误队列时传输不可用的首次等待，之后指数增长
    pub route_base_delay: Duration,
    /// 上述等待的上限
    pub route_max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            second_level_retries_enabled: false,
            error_queue: "error".to_string(),
            route_base_delay: Duration::from_millis(50),
            route_max_delay: Duration::from_secs(5),
        }
    }
}

/// 一次失败的记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// 记录后的计数（一级或二级，从 1 开始）
    pub attempt: u32,
    pub second_level: bool,
    pub handler: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryState {
    FirstLevelRetrying(u32),
    SecondLevelDispatch(u32),
    Exhausted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// 立即重新入队
    Redeliver,
    /// 一级耗尽，转入二级派发
    EscalateToSecondLevel,
    /// 永久失败
    DeadLetter { reason: String },
}

pub struct RetryCoordinator {
    policy: RetryPolicy,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    history: DashMap<String, Vec<FailureRecord>>,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            transport,
            clock,
            history: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 根据信封上的计数推导当前状态
    pub fn state_of(&self, envelope: &Envelope) -> RetryState {
        let max = self.policy.max_delivery_attempts;

        if envelope.second_level_attempts() > 0 {
            return if envelope.second_level_attempts() >= max {
                RetryState::Exhausted
            } else {
                RetryState::SecondLevelDispatch(envelope.second_level_attempts())
            };
        }

        if envelope.attempts() >= max {
            if self.policy.second_level_retries_enabled {
                RetryState::SecondLevelDispatch(0)
            } else {
                RetryState::Exhausted
            }
        } else {
            RetryState::FirstLevelRetrying(envelope.attempts())
        }
    }

    /// 记录一级失败并给出下一步
    pub fn on_failure(&self, envelope: &mut Envelope, handler: &str, error: &str) -> RetryDecision {
        let attempt = envelope.record_attempt();
        self.remember(envelope.message_id(), attempt, false, handler, error);

        if attempt < self.policy.max_delivery_attempts {
            warn!(
                message_id = envelope.message_id(),
                message_type = envelope.message_type(),
                attempt,
                handler,
                error,
                "delivery failed, redelivering"
            );
            return RetryDecision::Redeliver;
        }

        if self.policy.second_level_retries_enabled {
            warn!(
                message_id = envelope.message_id(),
                message_type = envelope.message_type(),
                attempt,
                "first-level attempts exhausted, escalating to second level"
            );
            RetryDecision::EscalateToSecondLevel
        } else {
            RetryDecision::DeadLetter {
                reason: exhausted_reason(envelope.message_id(), attempt, error),
            }
        }
    }

    /// 记录二级失败并给出下一步（二级不会再次升级）
    pub fn on_second_level_failure(
        &self,
        envelope: &mut Envelope,
        handler: &str,
        error: &str,
    ) -> RetryDecision {
        let attempt = envelope.record_second_level_attempt();
        self.remember(envelope.message_id(), attempt, true, handler, error);

        if attempt < self.policy.max_delivery_attempts {
            warn!(
                message_id = envelope.message_id(),
                message_type = envelope.message_type(),
                attempt,
                handler,
                error,
                "second-level dispatch failed, redelivering"
            );
            RetryDecision::Redeliver
        } else {
            RetryDecision::DeadLetter {
                reason: exhausted_reason(envelope.message_id(), attempt, error),
            }
        }
    }

    /// 成功终结：清除失败历史
    pub fn on_success(&self, envelope: &Envelope) {
        self.history.remove(envelope.message_id());
    }

    pub fn failures(&self, message_id: &str) -> Vec<FailureRecord> {
        self.history
            .get(message_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// 重新投递到信封原本的目的地址
    pub async fn redeliver(&self, envelope: Envelope) -> BusResult<()> {
        let destination = envelope.destination().to_string();
        self.route(&destination, envelope).await
    }

    /// 移入错误队列，附带错误详情、来源队列与完整失败历史
    pub async fn dead_letter(&self, mut envelope: Envelope, reason: &str) -> BusResult<()> {
        let failures = self
            .history
            .remove(envelope.message_id())
            .map(|(_, h)| h)
            .unwrap_or_default();

        let source_queue = envelope.destination().to_string();
        let history = serde_json::to_string(&failures)?;
        {
            let map = envelope.headers_mut();
            map.insert(headers::ERROR_DETAILS.to_string(), reason.to_string());
            map.insert(headers::SOURCE_QUEUE.to_string(), source_queue.clone());
            map.insert(headers::FAILURE_HISTORY.to_string(), history);
        }

        error!(
            message_id = envelope.message_id(),
            message_type = envelope.message_type(),
            source_queue = %source_queue,
            error_queue = %self.policy.error_queue,
            reason,
            "moving message to error queue"
        );

        let error_queue = self.policy.error_queue.clone();
        let envelope = envelope.with_destination(error_queue.clone());
        self.route(&error_queue, envelope).await
    }

    // 只有 `TransportUnavailable` 会被重试，其余错误原样返回
    async fn route(&self, destination: &str, envelope: Envelope) -> BusResult<()> {
        let mut delay = self.policy.route_base_delay;
        let mut failures = 0u32;

        loop {
            match self.transport.send(destination, envelope.clone()).await {
                Ok(()) => {
                    if failures > 0 {
                        warn!(
                            message_id = envelope.message_id(),
                            destination,
                            failures,
                            "message routed after transport recovered"
                        );
                    }
                    return Ok(());
                }
                Err(err @ BusError::TransportUnavailable { .. }) => {
                    failures += 1;
                    warn!(
                        message_id = envelope.message_id(),
                        destination,
                        failures,
                        ?delay,
                        error = %err,
                        "transport unavailable while routing, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.policy.route_max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn remember(&self, message_id: &str, attempt: u32, second_level: bool, handler: &str, error: &str) {
        self.history
            .entry(message_id.to_string())
            .or_default()
            .push(FailureRecord {
                attempt,
                second_level,
                handler: handler.to_string(),
                error: error.to_string(),
                failed_at: self.clock.now(),
            });
    }
}

fn exhausted_reason(message_id: &str, attempts: u32, last_error: &str) -> String {
    let err = BusError::ExhaustedRetries {
        message_id: message_id.to_string(),
        attempts,
    };
    format!("{err}; last error: {last_error}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::message::Message;
    use crate::transport::InMemoryTransport;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Job;

    impl Message for Job {
        const TYPE: &'static str = "Job";
    }

    fn coordinator(max: u32, second_level: bool) -> (RetryCoordinator, InMemoryTransport) {
        let transport = InMemoryTransport::default();
        let policy = RetryPolicy {
            max_delivery_attempts: max,
            second_level_retries_enabled: second_level,
            ..RetryPolicy::default()
        };
        let c = RetryCoordinator::new(policy, Arc::new(transport.clone()), Arc::new(SystemClock));
        (c, transport)
    }

    #[test]
    fn attempt_count_equals_failures_and_stops_at_max() {
        let (c, _) = coordinator(3, false);
        let mut env = Envelope::new("q", &Job).unwrap();

        assert_eq!(c.state_of(&env), RetryState::FirstLevelRetrying(0));
        assert_eq!(c.on_failure(&mut env, "h", "boom"), RetryDecision::Redeliver);
        assert_eq!(env.attempts(), 1);
        assert_eq!(c.on_failure(&mut env, "h", "boom"), RetryDecision::Redeliver);
        assert_eq!(env.attempts(), 2);
        assert!(matches!(
            c.on_failure(&mut env, "h", "boom"),
            RetryDecision::DeadLetter { .. }
        ));
        assert_eq!(env.attempts(), 3);
        assert_eq!(c.state_of(&env), RetryState::Exhausted);
        assert_eq!(c.failures(env.message_id()).len(), 3);
    }

    #[test]
    fn escalates_when_second_level_enabled() {
        let (c, _) = coordinator(2, true);
        let mut env = Envelope::new("q", &Job).unwrap();

        assert_eq!(c.on_failure(&mut env, "h", "e1"), RetryDecision::Redeliver);
        assert_eq!(
            c.on_failure(&mut env, "h", "e2"),
            RetryDecision::EscalateToSecondLevel
        );
        assert_eq!(c.state_of(&env), RetryState::SecondLevelDispatch(0));

        assert_eq!(
            c.on_second_level_failure(&mut env, "f", "e3"),
            RetryDecision::Redeliver
        );
        assert_eq!(c.state_of(&env), RetryState::SecondLevelDispatch(1));
        assert!(matches!(
            c.on_second_level_failure(&mut env, "f", "e4"),
            RetryDecision::DeadLetter { .. }
        ));
        assert_eq!(c.state_of(&env), RetryState::Exhausted);

        let history = c.failures(env.message_id());
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().filter(|f| f.second_level).count(), 2);
    }

    #[test]
    fn success_clears_history() {
        let (c, _) = coordinator(5, false);
        let mut env = Envelope::new("q", &Job).unwrap();
        c.on_failure(&mut env, "h", "boom");
        c.on_success(&env);
        assert!(c.failures(env.message_id()).is_empty());
    }

    #[tokio::test]
    async fn dead_letter_carries_failure_context() {
        let (c, transport) = coordinator(1, false);
        let mut env = Envelope::new("q", &Job).unwrap();
        let id = env.message_id().to_string();

        let RetryDecision::DeadLetter { reason } = c.on_failure(&mut env, "h", "kaput") else {
            panic!("expected dead letter");
        };
        c.dead_letter(env, &reason).await.unwrap();

        let received = transport.receive("error").await.unwrap().unwrap();
        let dead = DeadLetter::from_envelope(received).unwrap();
        assert_eq!(dead.envelope.message_id(), id);
        assert_eq!(dead.source_queue, "q");
        assert!(dead.error_details.contains("kaput"));
        assert_eq!(dead.failures.len(), 1);
        assert_eq!(dead.failures[0].handler, "h");
        assert!(c.failures(&id).is_empty());
    }
}
