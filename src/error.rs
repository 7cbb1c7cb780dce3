use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("invalid json record: {0}")]
    InvalidJson(String),
    #[error("record is missing {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp prefix: {0}")]
    InvalidTimestamp(String),
    #[error("invalid custom bonus amount: {0}")]
    InvalidAmount(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("event {0} was already credited")]
    Duplicate(String),
    #[error("ledger storage failure: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("webhook unavailable: {0}")]
    Unavailable(String),
    #[error("webhook rejected payload with status {0}")]
    Rejected(u16),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Unavailable(_) => true,
            SinkError::Rejected(status) => *status == 429 || *status >= 500,
        }
    }
}
