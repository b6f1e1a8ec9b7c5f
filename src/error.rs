use crate::domain::rail::RailKind;
use crate::domain::step_up::StepUpMethod;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by the settlement engine.
///
/// The variants map one-to-one onto HTTP status codes in
/// `interfaces::http`; storage and codec failures collapse into 500s.
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Provider '{0}' does not hold a current registration")]
    ProviderNotRegistered(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Step-up verification required (accepted methods: {methods:?})")]
    StepUpRequired { methods: Vec<StepUpMethod> },

    #[error(
        "Insufficient funds in category '{category_id}': requested {requested}, remaining {remaining}"
    )]
    InsufficientFunds {
        category_id: String,
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("Rail {rail} unavailable: {message}")]
    RailUnavailable { rail: RailKind, message: String },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A guarded ledger debit found less remaining than requested. Reaching
    /// this means reservation discipline was broken somewhere upstream.
    #[error("Ledger violation: {0}")]
    LedgerViolation(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl PaymentError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether the caller may safely resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RailUnavailable { .. } | Self::StepUpRequired { .. }
        )
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(err: rocksdb::Error) -> Self {
        Self::InternalError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
