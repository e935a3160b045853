use std::fmt;

/// Classification of ledger failures. Everything except `Fatal` is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    Transient,
    Timeout,
    NotFound,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct LedgerError {
    kind: LedgerErrorKind,
    operation: &'static str,
    message: String,
}

impl LedgerError {
    pub fn new(kind: LedgerErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
        }
    }

    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::Transient, operation, message)
    }

    pub fn not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::NotFound, operation, message)
    }

    pub fn fatal(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::Fatal, operation, message)
    }

    pub fn timeout(operation: &'static str) -> Self {
        Self::new(LedgerErrorKind::Timeout, operation, "request timed out")
    }

    pub fn kind(&self) -> LedgerErrorKind {
        self.kind
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, LedgerErrorKind::Fatal)
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            LedgerErrorKind::Transient => "transient",
            LedgerErrorKind::Timeout => "timeout",
            LedgerErrorKind::NotFound => "not found",
            LedgerErrorKind::Fatal => "fatal",
        };
        write!(f, "ledger {} failed ({label}): {}", self.operation, self.message)
    }
}

impl std::error::Error for LedgerError {}
