use std::fmt;

use thiserror::Error;

use crate::db::CellId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 存储错误的分类，决定是否需要重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// 超时、连接断开、数据库忙等，可以重试
    Transient,
    /// 配置错误、约束冲突、数据损坏等，重试没有意义
    Permanent,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// 搜索引擎错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 请求参数不合法，在访问存储之前就会被拒绝
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("cell not found: {0}")]
    NotFound(CellId),

    #[error("{kind} store error: {source}")]
    Store { kind: StoreErrorKind, source: BoxError },

    /// 调用方取消了搜索，已计算的部分结果全部丢弃
    #[error("search cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(source: impl Into<BoxError>) -> Self {
        Self::Store { kind: StoreErrorKind::Transient, source: source.into() }
    }

    pub fn permanent(source: impl Into<BoxError>) -> Self {
        Self::Store { kind: StoreErrorKind::Permanent, source: source.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { kind: StoreErrorKind::Transient, .. })
    }

    /// 用于日志和指标的简短错误名
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::NotFound(_) => "not_found",
            Self::Store { kind: StoreErrorKind::Transient, .. } => "store_transient",
            Self::Store { kind: StoreErrorKind::Permanent, .. } => "store_permanent",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
            Self::Task(_) => "task",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match classify_sqlx(&err) {
            StoreErrorKind::Transient => Self::transient(err),
            StoreErrorKind::Permanent => Self::permanent(err),
        }
    }
}

/// SQLite 的 BUSY / LOCKED 系列错误码（含扩展码）
const SQLITE_RETRYABLE_CODES: &[&str] = &["5", "6", "261", "262", "517"];

fn classify_sqlx(err: &sqlx::Error) -> StoreErrorKind {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
            StoreErrorKind::Transient
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if SQLITE_RETRYABLE_CODES.contains(&code) => StoreErrorKind::Transient,
            _ => StoreErrorKind::Permanent,
        },
        _ => StoreErrorKind::Permanent,
    }
}
