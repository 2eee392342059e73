use thiserror::Error;

/// Boxed error used for serializer and mutator failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled error")]
    Storage(#[from] sled::Error),
    #[error("serializer error")]
    Serialization(#[source] BoxError),
    #[error("mutator failed for record `{key}`")]
    Mutator {
        key: String,
        #[source]
        source: BoxError,
    },
    #[error("table data is corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Wrap any error raised by a [`crate::Serializer`] implementation.
    pub fn serialization(err: impl Into<BoxError>) -> Self {
        Self::Serialization(err.into())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(Box::new(err))
    }
}

impl From<sled::transaction::TransactionError<StoreError>> for StoreError {
    fn from(err: sled::transaction::TransactionError<StoreError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(err) => err,
            sled::transaction::TransactionError::Storage(err) => Self::Storage(err),
        }
    }
}

pub type DbResult<T> = Result<T, StoreError>;
