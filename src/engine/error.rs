use ulid::Ulid;

use crate::model::Ms;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid interval: from {from} must be before to {to}")]
    InvalidInterval { from: Ms, to: Ms },
    #[error("{0} not found: {1}")]
    NotFound(&'static str, Ulid),
    #[error("malformed duration policy: {0:?}")]
    PolicyMalformed(String),
    #[error("duration {duration}ms exceeds the source maximum of {max}ms")]
    PolicyViolation { duration: Ms, max: Ms },
    #[error("conflicts with reservation {0}")]
    OverlapConflict(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}
