//! 统一错误定义
//!
//! 按 Outbox 的错误分类组织：
//! - 校验/编程错误（提交前立即失败，绝不静默丢弃）；
//! - 存储错误（整个业务操作失败，由调用方从头重试）；
//! - 投递错误（由投递器按退避重试，或进入死信）。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 序列化/校验 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("parse error: {reason}")]
    Parse { reason: String },
    #[error("validation failed: {reason}")]
    Validation { reason: String },
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },

    // --- 存储 ---
    #[error("storage error: {reason}")]
    Storage { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },

    // --- 投递 ---
    #[error("publish failed: message_id={message_id}, retryable={retryable}, reason={reason}")]
    Publish {
        message_id: String,
        reason: String,
        retryable: bool,
    },
    #[error("publish timed out: message_id={message_id}, after_ms={after_ms}")]
    Timeout { message_id: String, after_ms: u64 },
    #[error("event bus error: {reason}")]
    EventBus { reason: String },
    #[error("event handler error: handler={handler}, reason={reason}")]
    EventHandler { handler: String, reason: String },

    // --- 通用 ---
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl DomainError {
    pub fn validation(reason: impl Into<String>) -> Self {
        DomainError::Validation {
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        DomainError::Storage {
            reason: reason.into(),
        }
    }

    pub fn event_bus(reason: impl Into<String>) -> Self {
        DomainError::EventBus {
            reason: reason.into(),
        }
    }

    /// 暂时性投递失败（传输不可达等），可重试
    pub fn transient_publish(message_id: impl ToString, reason: impl Into<String>) -> Self {
        DomainError::Publish {
            message_id: message_id.to_string(),
            reason: reason.into(),
            retryable: true,
        }
    }

    /// 消费方永久拒绝，直接进入死信
    pub fn permanent_publish(message_id: impl ToString, reason: impl Into<String>) -> Self {
        DomainError::Publish {
            message_id: message_id.to_string(),
            reason: reason.into(),
            retryable: false,
        }
    }

    /// 投递侧是否值得重试。
    ///
    /// 只有显式的永久拒绝与不可能自行恢复的数据错误不重试，其余一律按暂时性处理。
    pub fn is_retryable(&self) -> bool {
        match self {
            DomainError::Publish { retryable, .. } => *retryable,
            DomainError::Serde { .. }
            | DomainError::Parse { .. }
            | DomainError::Validation { .. }
            | DomainError::TypeMismatch { .. } => false,
            _ => true,
        }
    }
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

// ---- Cross-crate conversions for infrastructure convenience ----

#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DomainError::NotFound {
                reason: "row not found".to_string(),
            },
            sqlx::Error::Database(db) if db.is_unique_violation() => DomainError::Conflict {
                reason: db.message().to_string(),
            },
            other => DomainError::Database {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(feature = "infra-sqlx")]
impl From<sqlx::migrate::MigrateError> for DomainError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DomainError::Database {
            reason: err.to_string(),
        }
    }
}

impl From<uuid::Error> for DomainError {
    fn from(err: uuid::Error) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for DomainError {
    fn from(err: config::ConfigError) -> Self {
        DomainError::Config {
            reason: err.to_string(),
        }
    }
}

impl From<chrono::OutOfRangeError> for DomainError {
    fn from(err: chrono::OutOfRangeError) -> Self {
        DomainError::Config {
            reason: err.to_string(),
        }
    }
}
