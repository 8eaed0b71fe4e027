//! Kind-tagged errors for the OMS public surface.
//!
//! Background services (ingestor, scanners, decision loop) use `anyhow` and
//! swallow per-symbol failures; the OMS instead returns errors the caller can
//! dispatch on. Duplicate client order ids are resolved internally and never
//! reach this enum.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OmsError {
    /// Bad trading mode, strategy type, or missing required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Live mode without confirmation/enablement, or foreign order access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Plan/order id absent, or no executable decision.
    #[error("not found: {0}")]
    NotFound(String),

    /// Market data missing, exchange call failed; retryable by the caller.
    #[error("transient: {0}")]
    Transient(String),

    /// KV or relational store failure.
    #[error("storage: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type OmsResult<T> = Result<T, OmsError>;

impl OmsError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }
}
