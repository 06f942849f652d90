mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("WAL writer shut down")]
    WriterClosed,
}

/// Range-overlap query over one source: reservations whose window intersects
/// `span` and that share a participant with the candidate under `matching`.
#[derive(Debug, Clone, Copy)]
pub struct OverlapQuery<'a> {
    pub source_id: Ulid,
    pub span: Span,
    pub reserver_id: &'a str,
    pub reservee_id: &'a str,
    pub matching: ParticipantMatch,
}

/// Record storage behind the engine. Every write is a single atomic record
/// change; cross-record consistency (check-then-write) is the caller's job.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Customers ────────────────────────────────────────────
    async fn insert_customer(&self, customer: Customer) -> Result<(), StoreError>;
    async fn update_customer(&self, customer: Customer) -> Result<(), StoreError>;
    /// Cascades to the customer's secret, tokens and sources.
    async fn delete_customer(&self, id: Ulid) -> Result<(), StoreError>;
    async fn get_customer(&self, id: Ulid) -> Option<Customer>;
    async fn filter_customers(&self, filter: &CustomerFilter, page: PageRequest) -> Page<Customer>;

    // ── Credentials ──────────────────────────────────────────
    /// Replaces any secret the customer already holds.
    async fn put_secret(&self, secret: Secret) -> Result<(), StoreError>;
    async fn secret_for_customer(&self, customer_id: Ulid) -> Option<Secret>;
    async fn find_secret(&self, value: &str) -> Option<Secret>;
    async fn insert_token(&self, token: ApiToken) -> Result<(), StoreError>;
    async fn find_token(&self, value: &str) -> Option<ApiToken>;
    async fn delete_token(&self, id: Ulid) -> Result<(), StoreError>;
    async fn expired_tokens(&self, now: Ms) -> Vec<Ulid>;

    // ── Sources ──────────────────────────────────────────────
    async fn insert_source(&self, source: Source) -> Result<(), StoreError>;
    async fn update_source(&self, source: Source) -> Result<(), StoreError>;
    /// Cascades to the source's reservations and tokens.
    async fn delete_source(&self, id: Ulid) -> Result<(), StoreError>;
    async fn get_source(&self, id: Ulid) -> Option<Source>;
    async fn count_sources(&self, customer_id: Ulid) -> usize;
    async fn filter_sources(&self, filter: &SourceFilter, page: PageRequest) -> Page<Source>;

    // ── Reservations ─────────────────────────────────────────
    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError>;
    async fn update_reservation(&self, reservation: Reservation) -> Result<(), StoreError>;
    /// `Ok(false)` when nothing was stored under `id`.
    async fn delete_reservation(&self, id: Ulid) -> Result<bool, StoreError>;
    async fn get_reservation(&self, id: Ulid) -> Option<Reservation>;
    async fn count_reservations(&self, source_id: Ulid) -> usize;
    async fn overlapping(&self, query: &OverlapQuery<'_>) -> Vec<Reservation>;
    async fn filter_reservations(
        &self,
        filter: &ReservationFilter,
        page: PageRequest,
    ) -> Page<Reservation>;
}
