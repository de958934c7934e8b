// =============================================================================
// Structured error types for the signal-core engine
// =============================================================================
//
// Every component boundary (C1-C9) returns `Result<T, EngineError>` rather than
// an opaque `anyhow::Error`. Internally, exchange clients and repository code
// still use `anyhow::Result` with `.context(...)` for plumbing; at the trait
// boundary those get converted into a typed variant here via `From`/`map_err`.
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    UnsupportedSymbol,
    InsufficientNotional,
    MarkPriceUnavailable,
    RateLimited,
    ExchangeRejected,
    NetworkError,
    PositionNotFound,
    OrderNotFound,
    CooldownActive,
    OutOfRange,
    AlreadyClosed,
    DatabaseError,
    Timeout,
    UnknownError,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported symbol: {0}")]
    UnsupportedSymbol(String),

    #[error("insufficient notional: required {min}, got {actual}")]
    InsufficientNotional { min: String, actual: String },

    #[error("mark price unavailable for {0}")]
    MarkPriceUnavailable(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("exchange rejected request: {0}")]
    ExchangeRejected(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("position not found for {0}")]
    PositionNotFound(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("cooldown active, {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: u64 },

    #[error("price out of accepted range")]
    OutOfRange,

    #[error("trade already closed")]
    AlreadyClosed,

    #[error("repository error: {0}")]
    Database(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Validation(_) => ErrorCode::ValidationError,
            EngineError::UnsupportedSymbol(_) => ErrorCode::UnsupportedSymbol,
            EngineError::InsufficientNotional { .. } => ErrorCode::InsufficientNotional,
            EngineError::MarkPriceUnavailable(_) => ErrorCode::MarkPriceUnavailable,
            EngineError::RateLimited { .. } => ErrorCode::RateLimited,
            EngineError::ExchangeRejected(_) => ErrorCode::ExchangeRejected,
            EngineError::Network(_) => ErrorCode::NetworkError,
            EngineError::PositionNotFound(_) => ErrorCode::PositionNotFound,
            EngineError::OrderNotFound(_) => ErrorCode::OrderNotFound,
            EngineError::CooldownActive { .. } => ErrorCode::CooldownActive,
            EngineError::OutOfRange => ErrorCode::OutOfRange,
            EngineError::AlreadyClosed => ErrorCode::AlreadyClosed,
            EngineError::Database(_) => ErrorCode::DatabaseError,
            EngineError::Timeout(_) => ErrorCode::Timeout,
            EngineError::Unknown(_) => ErrorCode::UnknownError,
        }
    }

    /// Whether a caller should retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RateLimited { .. }
                | EngineError::Network(_)
                | EngineError::Timeout(_)
                | EngineError::MarkPriceUnavailable(_)
        )
    }

    /// Whether a cancel/close hitting this error should be treated as a
    /// successful no-op by at-least-once callers.
    pub fn is_idempotent_noop(&self) -> bool {
        matches!(self, EngineError::AlreadyClosed | EngineError::OrderNotFound(_))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Unknown(format!("{err:#}"))
    }
}

/// The envelope every public operation in this crate returns to its caller,
/// mirroring the `{success, data, error, error_code, metadata}` contract.
#[derive(Debug, Clone, Serialize)]
pub struct EngineResult<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl<T: Serialize> EngineResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
            metadata: None,
        }
    }

    pub fn ok_with_metadata(data: T, metadata: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
            metadata: Some(metadata),
        }
    }

    pub fn err(err: &EngineError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            error_code: Some(err.code()),
            metadata: None,
        }
    }
}
