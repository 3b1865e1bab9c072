//! Harness error type.

use sentinel_membrane::StackError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("stack: {0}")]
    Stack(#[from] StackError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown drill kind '{0}'")]
    UnknownDrill(String),
}
