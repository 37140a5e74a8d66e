use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out waiting for store response")]
    Timeout,
    #[error("script execution error: {0}")]
    Script(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("script not resident in store")]
    ScriptMissing,
}

impl From<StoreError> for limiter_core::CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout => limiter_core::CoreError::StoreTimeout,
            StoreError::Connection(msg) => limiter_core::CoreError::StoreUnavailable(msg),
            StoreError::ScriptMissing => limiter_core::CoreError::ScriptMissing,
            StoreError::Script(msg) => limiter_core::CoreError::StoreUnavailable(msg),
            StoreError::Serde(msg) => limiter_core::CoreError::Internal(msg),
        }
    }
}
