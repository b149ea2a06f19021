//! 消息（Message）与失败消息载体（Failed）
//!
//! `Message::TYPE` 是稳定的类型标签：它是分发表的键，也随信封在传输中传递。
//! 不要依赖 `type_name::<T>()`，重构会改变它。
//!
use crate::retry::FailureRecord;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// 可经总线发送的消息
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 消息的稳定类型标签（建议常量字符串，不随重构变化）
    const TYPE: &'static str;
}

/// 二级重试时派发给失败处理器的载体
///
/// 包含原始消息、触发失败的错误与一级/二级的失败历史。处理器可以借此
/// 决定补偿、记录，或通过总线重新 `defer_local` 原始消息。
#[derive(Debug, Clone)]
pub struct Failed<M> {
    message: M,
    message_id: String,
    headers: HashMap<String, String>,
    failures: Vec<FailureRecord>,
    second_level_attempt: u32,
}

impl<M> Failed<M> {
    pub(crate) fn new(
        message: M,
        message_id: String,
        headers: HashMap<String, String>,
        failures: Vec<FailureRecord>,
        second_level_attempt: u32,
    ) -> Self {
        Self {
            message,
            message_id,
            headers,
            failures,
            second_level_attempt,
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    /// 原始信封的消息 ID
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// 原始信封上的用户头
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// 最近一次失败的错误描述
    pub fn error_description(&self) -> &str {
        self.failures
            .last()
            .map(|f| f.error.as_str())
            .unwrap_or_default()
    }

    /// 按发生顺序排列的失败历史
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    /// 本次是第几次二级派发（从 1 开始）
    pub fn second_level_attempt(&self) -> u32 {
        self.second_level_attempt
    }
}
