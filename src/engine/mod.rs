mod accounts;
mod error;
mod locks;
mod queries;
mod reservations;
pub mod validator;

pub use error::EngineError;
pub use locks::KeyedLocks;

use std::sync::Arc;

use crate::auth::Hasher;
use crate::model::ParticipantMatch;
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Which participant pairings count as a clash when creating.
    pub create_match: ParticipantMatch,
    /// Same, when updating.
    pub update_match: ParticipantMatch,
    /// Salt mixed into generated secrets and tokens.
    pub hash_salt: String,
}

/// Command engine over a shared [`Store`].
///
/// Reservation create/update hold the source's lock across
/// overlap-read → validate → write, so two writers can never both pass the
/// check against the same snapshot. Source creation is serialized per
/// customer for the source-limit check.
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) source_locks: KeyedLocks,
    pub(crate) customer_locks: KeyedLocks,
    pub(crate) options: EngineOptions,
    pub(crate) hasher: Hasher,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, options: EngineOptions) -> Self {
        Self {
            store,
            source_locks: KeyedLocks::new(),
            customer_locks: KeyedLocks::new(),
            hasher: Hasher::new(options.hash_salt.clone()),
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}
