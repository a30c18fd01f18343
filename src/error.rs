use crate::catalog::PathId;
use crate::operation::TxId;
use crate::quota::QuotaCounter;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Domain,
    Path,
    Stream,
    Transaction,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Domain => write!(f, "domain"),
            ResourceType::Path => write!(f, "path"),
            ResourceType::Stream => write!(f, "stream"),
            ResourceType::Transaction => write!(f, "transaction"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    JournalCommit,
    Corruption,
    DomainNotFound,
    PathNotFound,
    StreamNotFound,
    TransactionNotFound,
    AlreadyClaimed,
    QuotaUnderflow,
    QuotaOverflow,
    OverrideAlreadyInstalled,
}

impl MetaErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            MetaErrorCode::Io => "io",
            MetaErrorCode::Encode => "encode",
            MetaErrorCode::Decode => "decode",
            MetaErrorCode::Validation => "validation",
            MetaErrorCode::InvalidConfig => "invalid_config",
            MetaErrorCode::JournalCommit => "journal_commit",
            MetaErrorCode::Corruption => "corruption",
            MetaErrorCode::DomainNotFound => "domain_not_found",
            MetaErrorCode::PathNotFound => "path_not_found",
            MetaErrorCode::StreamNotFound => "stream_not_found",
            MetaErrorCode::TransactionNotFound => "transaction_not_found",
            MetaErrorCode::AlreadyClaimed => "already_claimed",
            MetaErrorCode::QuotaUnderflow => "quota_underflow",
            MetaErrorCode::QuotaOverflow => "quota_overflow",
            MetaErrorCode::OverrideAlreadyInstalled => "override_already_installed",
        }
    }

    /// Infrastructure failures the caller may retry unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(self, MetaErrorCode::Io | MetaErrorCode::JournalCommit)
    }
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("journal commit failed: {message}")]
    JournalCommit { message: String },
    #[error("journal corruption: {message}")]
    Corruption { message: String },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("path {path_id} is already claimed by tx {owner}")]
    AlreadyClaimed { path_id: PathId, owner: TxId },
    #[error("quota underflow in domain {domain_id}: {counter}")]
    QuotaUnderflow {
        domain_id: PathId,
        counter: QuotaCounter,
    },
    #[error("quota overflow in domain {domain_id}: {counter}")]
    QuotaOverflow {
        domain_id: PathId,
        counter: QuotaCounter,
    },
    #[error("a persist override is already installed")]
    OverrideAlreadyInstalled,
}

impl MetaError {
    pub fn code(&self) -> MetaErrorCode {
        match self {
            MetaError::Io(_) => MetaErrorCode::Io,
            MetaError::Encode(_) => MetaErrorCode::Encode,
            MetaError::Decode(_) => MetaErrorCode::Decode,
            MetaError::Validation(_) => MetaErrorCode::Validation,
            MetaError::InvalidConfig { .. } => MetaErrorCode::InvalidConfig,
            MetaError::JournalCommit { .. } => MetaErrorCode::JournalCommit,
            MetaError::Corruption { .. } => MetaErrorCode::Corruption,
            MetaError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Domain => MetaErrorCode::DomainNotFound,
                ResourceType::Path => MetaErrorCode::PathNotFound,
                ResourceType::Stream => MetaErrorCode::StreamNotFound,
                ResourceType::Transaction => MetaErrorCode::TransactionNotFound,
            },
            MetaError::AlreadyClaimed { .. } => MetaErrorCode::AlreadyClaimed,
            MetaError::QuotaUnderflow { .. } => MetaErrorCode::QuotaUnderflow,
            MetaError::QuotaOverflow { .. } => MetaErrorCode::QuotaOverflow,
            MetaError::OverrideAlreadyInstalled => MetaErrorCode::OverrideAlreadyInstalled,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}

/// Aborts the process on a broken in-memory invariant.
///
/// Continuing after the tree, ledger or journal disagree would risk persisting
/// corrupted metadata, so these conditions are never turned into `Result`s.
#[track_caller]
pub fn fatal(message: impl std::fmt::Display) -> ! {
    tracing::error!(%message, "metashard invariant violation");
    panic!("metashard invariant violation: {message}");
}
