use thiserror::Error;

use crate::identity::AuthError;
use crate::validate::FieldError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("not found")]
    NotFound,
    #[error("capacity exceeded")]
    CapacityExceeded,
    #[error("policy violation: {0}")]
    Policy(String),
    #[error("validation failed")]
    Validation(Vec<FieldError>),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("store error: {0}")]
    Store(#[from] tether_store::StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}
