use thiserror::Error;

use crate::limits::CANCELLATION_CUTOFF_HOURS;
use crate::model::Id;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("time slot is not available (conflicts with reservation {conflicting})")]
    SlotUnavailable { conflicting: Id },
    #[error(
        "cannot cancel less than {hours} hours before start",
        hours = CANCELLATION_CUTOFF_HOURS
    )]
    CancellationWindowClosed,
    #[error("cannot {action}: {entity} is {from}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },
    #[error("{context}: {source}")]
    StoreFailure {
        context: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ServiceError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ServiceError::InvalidInput(msg.into())
    }

    pub fn transition(entity: &'static str, from: impl ToString, action: &'static str) -> Self {
        ServiceError::InvalidStateTransition {
            entity,
            from: from.to_string(),
            action,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput(_) => "invalid_input",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Unauthorized(_) => "unauthorized",
            ServiceError::SlotUnavailable { .. } => "slot_unavailable",
            ServiceError::CancellationWindowClosed => "cancellation_window_closed",
            ServiceError::InvalidStateTransition { .. } => "invalid_state_transition",
            ServiceError::StoreFailure { .. } => "store_failure",
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Map a store error into the service vocabulary. Missing records and
/// overlaps keep their meaning; anything else is wrapped with `context`.
pub(crate) fn store_err(context: &'static str) -> impl Fn(StoreError) -> ServiceError {
    move |e| match e {
        StoreError::NotFound { entity, .. } => ServiceError::NotFound(entity.to_string()),
        StoreError::Conflict(id) => ServiceError::SlotUnavailable { conflicting: id },
        source => ServiceError::StoreFailure { context, source },
    }
}
