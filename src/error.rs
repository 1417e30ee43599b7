use std::fmt;

/// Crate-wide error kinds. Variants mirror the error-handling design: each
/// carries just enough context to log or report without leaking internals
/// to a caller.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Malformed input at the ingestion boundary, rejected before admission.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Update filtered by rate/movement/age rules.
    #[error("admission rejected: {0}")]
    Admission(String),

    /// Relational or KV store failure. Callers should log and continue,
    /// never abort a batch over one of these.
    #[error("transient store error: {0}")]
    Transient(String),

    /// NX-lock not acquired, or a status-gated update did not match its
    /// expected prior state. Treated as a normal no-op, not a failure.
    #[error("contention: {0}")]
    Contention(String),

    /// Cooldown or ownership check denied the operation.
    #[error("policy denial: {0}")]
    PolicyDenial(String),

    /// Agent, judge, or queue collaborator failure.
    #[error("external collaborator error: {0}")]
    External(String),

    /// Invariant violation. Propagated and logged with full context; these
    /// indicate a programming error, not a user-facing condition.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl AppError {
    pub fn transient(msg: impl fmt::Display) -> Self {
        AppError::Transient(msg.to_string())
    }

    pub fn fatal(msg: impl fmt::Display) -> Self {
        AppError::Fatal(msg.to_string())
    }

    pub fn external(msg: impl fmt::Display) -> Self {
        AppError::External(msg.to_string())
    }

    /// True for kinds that are expected, non-exceptional outcomes rather
    /// than bugs — contention and policy denial are normal traffic.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            AppError::Admission(_) | AppError::Contention(_) | AppError::PolicyDenial(_)
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;
