//! 总线统一错误定义
//!
//! 覆盖投递入队（传输/定时存储）、处理器执行、重试耗尽、配置校验与信封编解码，
//! 便于在各实现层统一转换为 `BusError`。
//!
use std::time::Duration;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 入队路径（同步返回给调用方）---
    #[error("transport unavailable: {reason}")]
    TransportUnavailable { reason: String },
    #[error("timeout store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    // --- 投递/处理 ---
    #[error("handler failure: handler={handler}, reason={reason}")]
    HandlerFailure { handler: String, reason: String },
    #[error("exhausted retries: message_id={message_id}, attempts={attempts}")]
    ExhaustedRetries { message_id: String, attempts: u32 },

    // --- 配置 ---
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
    #[error("service not registered: {service}")]
    ServiceNotRegistered { service: &'static str },

    // --- 编解码 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },
    #[error("invalid header: header={header}, reason={reason}")]
    InvalidHeader { header: String, reason: String },

    // --- 生命周期 ---
    #[error("shutdown timed out after {timeout:?}, abandoned workers={abandoned}")]
    ShutdownTimeout { timeout: Duration, abandoned: usize },
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    pub fn transport(reason: impl Into<String>) -> Self {
        BusError::TransportUnavailable {
            reason: reason.into(),
        }
    }

    pub fn store(reason: impl Into<String>) -> Self {
        BusError::StoreUnavailable {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        BusError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn invalid_header(header: impl Into<String>, reason: impl Into<String>) -> Self {
        BusError::InvalidHeader {
            header: header.into(),
            reason: reason.into(),
        }
    }
}

