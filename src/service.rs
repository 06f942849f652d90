use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::{AuthError, Authenticator, Principal};
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;
use crate::observability;
use crate::sql::{Command, Credential, SqlError};

/// Credentials a connection has supplied via `SET`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub jwt: Option<String>,
    pub api_secret: Option<String>,
    pub api_token: Option<String>,
}

impl Session {
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Self {
        let get = |c: Credential| metadata.get(c.key()).cloned();
        Self {
            jwt: get(Credential::Jwt),
            api_secret: get(Credential::ApiSecret),
            api_token: get(Credential::ApiToken),
        }
    }

    fn slot(&mut self, credential: Credential) -> &mut Option<String> {
        match credential {
            Credential::Jwt => &mut self.jwt,
            Credential::ApiSecret => &mut self.api_secret,
            Credential::ApiToken => &mut self.api_token,
        }
    }

    /// An empty value clears the credential.
    pub fn set(&mut self, credential: Credential, value: String) {
        *self.slot(credential) = Some(value).filter(|v| !v.is_empty());
    }

    pub fn write_metadata(&self, metadata: &mut HashMap<String, String>) {
        for (credential, value) in [
            (Credential::Jwt, &self.jwt),
            (Credential::ApiSecret, &self.api_secret),
            (Credential::ApiToken, &self.api_token),
        ] {
            match value {
                Some(v) => metadata.insert(credential.key().to_string(), v.clone()),
                None => metadata.remove(credential.key()),
            };
        }
    }

    fn has_api_key(&self) -> bool {
        self.api_secret.is_some() && self.api_token.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// What a statement produced, ready for the wire layer to encode.
#[derive(Debug)]
pub enum Outcome {
    Set,
    Inserted(Ulid),
    Updated(Ulid),
    Deleted(Ulid),
    Secret(Secret),
    Token(ApiToken),
    Reservation(Reservation),
    Reservations { page: Page<Reservation>, size: u32 },
    Source(Source),
    Sources { page: Page<Source>, size: u32 },
    Customer(Customer),
    Customers { page: Page<Customer>, size: u32 },
}

/// Authenticates each statement and applies ownership scoping before
/// handing it to the engine.
///
/// Reservation statements take an API key. Customer, secret and token
/// statements take a JWT; creating customers needs an admin JWT. Source
/// statements accept either, so a customer can create its first source
/// before it holds a token. Records owned by another customer read as
/// missing and delete as no-ops.
pub struct Service {
    engine: Arc<Engine>,
    auth: Arc<Authenticator>,
}

impl Service {
    pub fn new(engine: Arc<Engine>, auth: Arc<Authenticator>) -> Self {
        Self { engine, auth }
    }

    pub async fn execute(&self, session: &mut Session, cmd: Command) -> Result<Outcome, ServiceError> {
        match cmd {
            Command::SetCredential { credential, value } => {
                session.set(credential, value);
                Ok(Outcome::Set)
            }
            Command::SetOther { name } => {
                debug!(%name, "ignoring SET");
                Ok(Outcome::Set)
            }

            // ── Reservations ─────────────────────────────────
            Command::InsertReservation(new) => {
                let p = self.api_key(session).await?;
                self.owned_source(&p, new.source_id).await?;
                Ok(Outcome::Inserted(self.engine.create_reservation(new).await?))
            }
            Command::UpdateReservation { id, patch } => {
                let p = self.api_key(session).await?;
                self.owned_reservation(&p, id).await?;
                Ok(Outcome::Updated(self.engine.update_reservation(id, patch).await?))
            }
            Command::DeleteReservation { id } => {
                let p = self.api_key(session).await?;
                match self.owned_reservation(&p, id).await {
                    Ok(_) => self.engine.delete_reservation(id).await?,
                    Err(EngineError::NotFound(..)) => id,
                    Err(e) => return Err(e.into()),
                };
                Ok(Outcome::Deleted(id))
            }
            Command::SelectReservation { id } => {
                let p = self.api_key(session).await?;
                Ok(Outcome::Reservation(self.owned_reservation(&p, id).await?))
            }
            Command::SelectReservations { mut filter, page } => {
                let p = self.api_key(session).await?;
                filter.customer_id = p.customer_id;
                Ok(Outcome::Reservations {
                    page: self.engine.list_reservations(&filter, page).await?,
                    size: effective_size(page),
                })
            }

            // ── Sources ──────────────────────────────────────
            Command::InsertSource {
                customer_id,
                name,
                max_possible_duration,
            } => {
                let p = self.source_principal(session).await?;
                let owner = acting_customer(&p, customer_id)?;
                Ok(Outcome::Inserted(
                    self.engine
                        .create_source(owner, name, max_possible_duration)
                        .await?,
                ))
            }
            Command::UpdateSource { id, patch } => {
                let p = self.source_principal(session).await?;
                self.owned_source(&p, id).await?;
                Ok(Outcome::Updated(self.engine.update_source(id, patch).await?))
            }
            Command::DeleteSource { id } => {
                let p = self.source_principal(session).await?;
                match self.owned_source(&p, id).await {
                    Ok(_) => self.engine.delete_source(id).await?,
                    Err(EngineError::NotFound(..)) => id,
                    Err(e) => return Err(e.into()),
                };
                Ok(Outcome::Deleted(id))
            }
            Command::SelectSource { id } => {
                let p = self.source_principal(session).await?;
                Ok(Outcome::Source(self.owned_source(&p, id).await?))
            }
            Command::SelectSources { mut filter, page } => {
                let p = self.source_principal(session).await?;
                if !p.admin {
                    if filter.customer_id.is_some_and(|c| !p.can_act_for(c)) {
                        return Err(AuthError::Forbidden("customer_id names another customer").into());
                    }
                    filter.customer_id = p.customer_id;
                }
                Ok(Outcome::Sources {
                    page: self.engine.list_sources(&filter, page).await?,
                    size: effective_size(page),
                })
            }

            // ── Customers ────────────────────────────────────
            Command::InsertCustomer {
                name,
                company,
                email,
            } => {
                let p = self.jwt(session).await?;
                if !p.admin {
                    return Err(AuthError::Forbidden("creating customers needs an admin JWT").into());
                }
                Ok(Outcome::Inserted(
                    self.engine.create_customer(name, company, email).await?,
                ))
            }
            Command::UpdateCustomer { id, patch } => {
                let p = self.jwt(session).await?;
                if !p.can_act_for(id) {
                    return Err(EngineError::NotFound("customer", id).into());
                }
                if patch.max_source_limit.is_some() && !p.admin {
                    return Err(AuthError::Forbidden("max_source_limit needs an admin JWT").into());
                }
                Ok(Outcome::Updated(self.engine.update_customer(id, patch).await?))
            }
            Command::DeleteCustomer { id } => {
                let p = self.jwt(session).await?;
                if p.can_act_for(id) {
                    self.engine.delete_customer(id).await?;
                }
                Ok(Outcome::Deleted(id))
            }
            Command::SelectCustomer { id } => {
                let p = self.jwt(session).await?;
                if !p.can_act_for(id) {
                    return Err(EngineError::NotFound("customer", id).into());
                }
                Ok(Outcome::Customer(self.engine.get_customer(id).await?))
            }
            Command::SelectCustomers { mut filter, page } => {
                let p = self.jwt(session).await?;
                if !p.admin
                    && let Some(own) = p.customer_id
                {
                    // Nil never names a stored customer, so a foreign id list matches nothing.
                    let visible = filter.ids.is_empty() || filter.ids.contains(&own);
                    filter.ids = vec![if visible { own } else { Ulid::nil() }];
                }
                Ok(Outcome::Customers {
                    page: self.engine.list_customers(&filter, page).await?,
                    size: effective_size(page),
                })
            }

            // ── Credentials ──────────────────────────────────
            Command::IssueSecret { customer_id } => {
                let p = self.jwt(session).await?;
                let owner = acting_customer(&p, customer_id)?;
                Ok(Outcome::Secret(self.engine.issue_secret(owner).await?))
            }
            Command::IssueToken {
                source_id,
                customer_id,
            } => {
                let p = self.jwt(session).await?;
                let owner = acting_customer(&p, customer_id)?;
                Ok(Outcome::Token(self.engine.issue_token(owner, source_id).await?))
            }
        }
    }

    // ── Credential checks ────────────────────────────────────

    async fn jwt(&self, session: &Session) -> Result<Principal, AuthError> {
        let result = match &session.jwt {
            Some(raw) => self.auth.verify_jwt(raw).await,
            None => Err(AuthError::Missing("jwt")),
        };
        record_auth("jwt", result)
    }

    async fn api_key(&self, session: &Session) -> Result<Principal, AuthError> {
        let result = match (&session.api_secret, &session.api_token) {
            (Some(secret), Some(token)) => self.auth.verify_api_key(secret, token, now_ms()).await,
            (None, _) => Err(AuthError::Missing("api_secret")),
            (_, None) => Err(AuthError::Missing("api_token")),
        };
        record_auth("api_key", result)
    }

    /// API key when one is set, otherwise the JWT.
    async fn source_principal(&self, session: &Session) -> Result<Principal, AuthError> {
        if session.has_api_key() || session.jwt.is_none() {
            self.api_key(session).await
        } else {
            self.jwt(session).await
        }
    }

    // ── Ownership ────────────────────────────────────────────

    async fn owned_source(&self, p: &Principal, id: Ulid) -> Result<Source, EngineError> {
        match self.engine.get_source(id).await {
            Ok(source) if p.can_act_for(source.customer_id) => Ok(source),
            Ok(_) => Err(EngineError::NotFound("source", id)),
            Err(e) => Err(e),
        }
    }

    async fn owned_reservation(&self, p: &Principal, id: Ulid) -> Result<Reservation, EngineError> {
        let reservation = self.engine.get_reservation(id).await?;
        match self.owned_source(p, reservation.source_id).await {
            Ok(_) => Ok(reservation),
            Err(EngineError::NotFound(..)) => Err(EngineError::NotFound("reservation", id)),
            Err(e) => Err(e),
        }
    }
}

/// The customer a credential statement acts for: the one named, if the
/// principal may act for it, else the principal's own.
fn acting_customer(p: &Principal, named: Option<Ulid>) -> Result<Ulid, AuthError> {
    match named {
        Some(id) if p.can_act_for(id) => Ok(id),
        Some(_) => Err(AuthError::Forbidden("customer_id names another customer")),
        None => p
            .customer_id
            .ok_or(AuthError::Forbidden("an admin JWT without a subject must name customer_id")),
    }
}

fn record_auth(scheme: &'static str, result: Result<Principal, AuthError>) -> Result<Principal, AuthError> {
    if let Err(e) = &result {
        warn!(scheme, error = %e, "credential rejected");
        metrics::counter!(observability::AUTH_FAILURES_TOTAL, "scheme" => scheme).increment(1);
    }
    result
}

fn effective_size(page: PageRequest) -> u32 {
    page.size.min(MAX_PAGE_SIZE)
}
