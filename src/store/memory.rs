use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::{OverlapQuery, Store, StoreError};

pub type SharedSourceState = Arc<RwLock<SourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Takes the first waiting append, drains whatever else is
/// already queued, and commits the whole batch with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes never ride along with the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed as control command")));
        }
    }
}

/// In-memory record store made durable by the WAL.
///
/// Reservations live inside their source's `SourceState`, sorted by start,
/// behind a per-source `RwLock`. Every mutation is one `Event`: appended to
/// the log first, applied to memory only once the append is durable.
pub struct MemoryStore {
    customers: DashMap<Ulid, Customer>,
    /// customer id → secret
    secrets: DashMap<Ulid, Secret>,
    /// secret value → customer id
    secret_values: DashMap<String, Ulid>,
    tokens: DashMap<Ulid, ApiToken>,
    /// token value → token id
    token_values: DashMap<String, Ulid>,
    sources: DashMap<Ulid, SharedSourceState>,
    /// source id → owning customer id
    source_owner: DashMap<Ulid, Ulid>,
    /// reservation id → source id
    reservation_source: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared; compaction takes it exclusively so no event
    /// lands between the snapshot and the file swap.
    commit_gate: RwLock<()>,
}

impl MemoryStore {
    /// Replays the WAL at `wal_path` and starts the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub async fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            customers: DashMap::new(),
            secrets: DashMap::new(),
            secret_values: DashMap::new(),
            tokens: DashMap::new(),
            token_values: DashMap::new(),
            sources: DashMap::new(),
            source_owner: DashMap::new(),
            reservation_source: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
        };
        for event in &events {
            store.apply(event).await;
        }
        info!(
            path = %wal_path.display(),
            events = events.len(),
            customers = store.customers.len(),
            sources = store.sources.len(),
            reservations = store.reservation_source.len(),
            "store replayed"
        );
        Ok(store)
    }

    fn source_state(&self, id: &Ulid) -> Option<SharedSourceState> {
        self.sources.get(id).map(|e| e.value().clone())
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        rx.await
            .map_err(|_| StoreError::WriterClosed)?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Append then apply. A failed append leaves memory untouched.
    async fn commit(&self, event: Event) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        self.apply(&event).await;
        Ok(())
    }

    async fn apply(&self, event: &Event) {
        match event {
            Event::CustomerCreated(c) | Event::CustomerUpdated(c) => {
                self.customers.insert(c.id, c.clone());
            }
            Event::CustomerDeleted { id } => {
                self.customers.remove(id);
                if let Some((_, secret)) = self.secrets.remove(id) {
                    self.secret_values.remove(&secret.value);
                }
                self.drop_tokens(|t| t.customer_id == *id);
                let owned: Vec<Ulid> = self
                    .source_owner
                    .iter()
                    .filter(|e| e.value() == id)
                    .map(|e| *e.key())
                    .collect();
                for source_id in owned {
                    self.drop_source(source_id).await;
                }
            }
            Event::SecretIssued(secret) => {
                if let Some(old) = self.secrets.insert(secret.customer_id, secret.clone()) {
                    self.secret_values.remove(&old.value);
                }
                self.secret_values
                    .insert(secret.value.clone(), secret.customer_id);
            }
            Event::TokenIssued(token) => {
                if !self.sources.contains_key(&token.source_id) {
                    return;
                }
                self.token_values.insert(token.value.clone(), token.id);
                self.tokens.insert(token.id, token.clone());
            }
            Event::TokenRevoked { id } => {
                if let Some((_, token)) = self.tokens.remove(id) {
                    self.token_values.remove(&token.value);
                }
            }
            Event::SourceCreated(source) => {
                self.source_owner.insert(source.id, source.customer_id);
                self.sources.insert(
                    source.id,
                    Arc::new(RwLock::new(SourceState::new(source.clone()))),
                );
            }
            Event::SourceUpdated(source) => {
                if let Some(state) = self.source_state(&source.id) {
                    state.write().await.source = source.clone();
                }
            }
            Event::SourceDeleted { id } => self.drop_source(*id).await,
            Event::ReservationCreated(r) => {
                if let Some(state) = self.source_state(&r.source_id) {
                    state.write().await.insert_reservation(r.clone());
                    self.reservation_source.insert(r.id, r.source_id);
                }
            }
            Event::ReservationUpdated(r) => {
                if let Some(state) = self.source_state(&r.source_id) {
                    let mut guard = state.write().await;
                    if guard.remove_reservation(r.id).is_some() {
                        guard.insert_reservation(r.clone());
                    }
                }
            }
            Event::ReservationDeleted { id, source_id } => {
                if let Some(state) = self.source_state(source_id) {
                    state.write().await.remove_reservation(*id);
                }
                self.reservation_source.remove(id);
            }
        }
    }

    async fn drop_source(&self, id: Ulid) {
        self.source_owner.remove(&id);
        if let Some((_, state)) = self.sources.remove(&id) {
            for r in &state.read().await.reservations {
                self.reservation_source.remove(&r.id);
            }
        }
        self.drop_tokens(|t| t.source_id == id);
    }

    fn drop_tokens(&self, pred: impl Fn(&ApiToken) -> bool) {
        let doomed: Vec<ApiToken> = self
            .tokens
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        for token in doomed {
            self.tokens.remove(&token.id);
            self.token_values.remove(&token.value);
        }
    }

    /// Rewrite the WAL as the minimal event set that recreates current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .customers
            .iter()
            .map(|e| Event::CustomerCreated(e.value().clone()))
            .collect();
        events.extend(self.secrets.iter().map(|e| Event::SecretIssued(e.value().clone())));
        let states: Vec<SharedSourceState> =
            self.sources.iter().map(|e| e.value().clone()).collect();
        let mut reservations = Vec::new();
        for state in states {
            let guard = state.read().await;
            events.push(Event::SourceCreated(guard.source.clone()));
            reservations.extend(guard.reservations.iter().cloned().map(Event::ReservationCreated));
        }
        events.extend(self.tokens.iter().map(|e| Event::TokenIssued(e.value().clone())));
        events.extend(reservations);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        rx.await
            .map_err(|_| StoreError::WriterClosed)?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        debug!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_customer(&self, customer: Customer) -> Result<(), StoreError> {
        self.commit(Event::CustomerCreated(customer)).await
    }

    async fn update_customer(&self, customer: Customer) -> Result<(), StoreError> {
        self.commit(Event::CustomerUpdated(customer)).await
    }

    async fn delete_customer(&self, id: Ulid) -> Result<(), StoreError> {
        if !self.customers.contains_key(&id) {
            return Ok(());
        }
        self.commit(Event::CustomerDeleted { id }).await
    }

    async fn get_customer(&self, id: Ulid) -> Option<Customer> {
        self.customers.get(&id).map(|e| e.value().clone())
    }

    async fn filter_customers(&self, filter: &CustomerFilter, page: PageRequest) -> Page<Customer> {
        let mut hits: Vec<Customer> = self
            .customers
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|c| c.id);
        Page::paginate(hits, page)
    }

    async fn put_secret(&self, secret: Secret) -> Result<(), StoreError> {
        self.commit(Event::SecretIssued(secret)).await
    }

    async fn secret_for_customer(&self, customer_id: Ulid) -> Option<Secret> {
        self.secrets.get(&customer_id).map(|e| e.value().clone())
    }

    async fn find_secret(&self, value: &str) -> Option<Secret> {
        let customer_id = *self.secret_values.get(value)?.value();
        self.secrets.get(&customer_id).map(|e| e.value().clone())
    }

    async fn insert_token(&self, token: ApiToken) -> Result<(), StoreError> {
        self.commit(Event::TokenIssued(token)).await
    }

    async fn find_token(&self, value: &str) -> Option<ApiToken> {
        let id = *self.token_values.get(value)?.value();
        self.tokens.get(&id).map(|e| e.value().clone())
    }

    async fn delete_token(&self, id: Ulid) -> Result<(), StoreError> {
        if !self.tokens.contains_key(&id) {
            return Ok(());
        }
        self.commit(Event::TokenRevoked { id }).await
    }

    async fn expired_tokens(&self, now: Ms) -> Vec<Ulid> {
        self.tokens
            .iter()
            .filter(|e| e.value().valid_until <= now)
            .map(|e| *e.key())
            .collect()
    }

    async fn insert_source(&self, source: Source) -> Result<(), StoreError> {
        self.commit(Event::SourceCreated(source)).await
    }

    async fn update_source(&self, source: Source) -> Result<(), StoreError> {
        self.commit(Event::SourceUpdated(source)).await
    }

    async fn delete_source(&self, id: Ulid) -> Result<(), StoreError> {
        if !self.sources.contains_key(&id) {
            return Ok(());
        }
        self.commit(Event::SourceDeleted { id }).await
    }

    async fn get_source(&self, id: Ulid) -> Option<Source> {
        let state = self.source_state(&id)?;
        let source = state.read().await.source.clone();
        Some(source)
    }

    async fn count_sources(&self, customer_id: Ulid) -> usize {
        self.source_owner
            .iter()
            .filter(|e| *e.value() == customer_id)
            .count()
    }

    async fn filter_sources(&self, filter: &SourceFilter, page: PageRequest) -> Page<Source> {
        let states: Vec<SharedSourceState> =
            self.sources.iter().map(|e| e.value().clone()).collect();
        let mut hits = Vec::new();
        for state in states {
            let guard = state.read().await;
            if filter.matches(&guard.source) {
                hits.push(guard.source.clone());
            }
        }
        hits.sort_by_key(|s| s.id);
        Page::paginate(hits, page)
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.commit(Event::ReservationCreated(reservation)).await
    }

    async fn update_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.commit(Event::ReservationUpdated(reservation)).await
    }

    async fn delete_reservation(&self, id: Ulid) -> Result<bool, StoreError> {
        let Some(source_id) = self.reservation_source.get(&id).map(|e| *e.value()) else {
            return Ok(false);
        };
        self.commit(Event::ReservationDeleted { id, source_id }).await?;
        Ok(true)
    }

    async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let source_id = *self.reservation_source.get(&id)?.value();
        let state = self.source_state(&source_id)?;
        let guard = state.read().await;
        guard.get_reservation(id).cloned()
    }

    async fn count_reservations(&self, source_id: Ulid) -> usize {
        match self.source_state(&source_id) {
            Some(state) => state.read().await.reservations.len(),
            None => 0,
        }
    }

    async fn overlapping(&self, query: &OverlapQuery<'_>) -> Vec<Reservation> {
        let Some(state) = self.source_state(&query.source_id) else {
            return Vec::new();
        };
        let guard = state.read().await;
        guard
            .overlapping(&query.span)
            .filter(|r| {
                query
                    .matching
                    .shares(query.reserver_id, query.reservee_id, r)
            })
            .cloned()
            .collect()
    }

    async fn filter_reservations(
        &self,
        filter: &ReservationFilter,
        page: PageRequest,
    ) -> Page<Reservation> {
        let states: Vec<SharedSourceState> = match filter.source_id {
            Some(id) => self.source_state(&id).into_iter().collect(),
            None => self.sources.iter().map(|e| e.value().clone()).collect(),
        };
        let mut hits = Vec::new();
        for state in states {
            let guard = state.read().await;
            if filter
                .customer_id
                .is_some_and(|c| c != guard.source.customer_id)
            {
                continue;
            }
            hits.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        hits.sort_by_key(|r| (r.from, r.id));
        Page::paginate(hits, page)
    }
}
