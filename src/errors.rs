use serde::Serialize;
use uuid::Uuid;

use crate::store::StoreError;

/// Crate-wide error type returned by every service and event handler.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Errors an outbound call may be retried on. Everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExternalServiceError(_) | Self::Timeout(_) | Self::ConcurrentModification(_)
        )
    }

    /// Short machine-readable label, used for metric labels and dead letters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreError(_) => "store",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::InvalidStatus(_) => "invalid_status",
            Self::EventError(_) => "event",
            Self::InternalError(_) => "internal",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::ExternalServiceError(_) => "external_service",
            Self::Timeout(_) => "timeout",
            Self::SerializationError(_) => "serialization",
        }
    }
}

// Aliases kept so module signatures read by domain.
pub type OrderError = ServiceError;
pub type InventoryError = ServiceError;
pub type DispatchError = ServiceError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ServiceError::Timeout("courier".into()).is_transient());
        assert!(ServiceError::ExternalServiceError("502".into()).is_transient());
        assert!(!ServiceError::ValidationError("bad".into()).is_transient());
        assert!(!ServiceError::NotFound("order".into()).is_transient());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(ServiceError::InvalidStatus("parked".into()).kind(), "invalid_status");
        assert_eq!(
            ServiceError::StoreError(StoreError::Backend("disk".into())).kind(),
            "store"
        );
        assert_eq!(
            ServiceError::ConcurrentModification(Uuid::nil()).kind(),
            "concurrent_modification"
        );
    }
}
