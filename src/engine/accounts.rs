use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::policy::Policy;

use super::{Engine, EngineError};

fn looks_like_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

fn check_name(name: &str, field: &'static str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::InvalidInput(field));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_email(email: &str) -> Result<(), EngineError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    if !looks_like_email(email) {
        return Err(EngineError::InvalidInput("email must look like local@domain"));
    }
    Ok(())
}

/// `Some` only for a non-empty replacement; empty strings leave the field alone.
fn replacement(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

impl Engine {
    // ── Customers ────────────────────────────────────────────

    pub async fn create_customer(
        &self,
        name: String,
        company: String,
        email: String,
    ) -> Result<Ulid, EngineError> {
        check_name(&name, "name is required")?;
        if company.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("company too long"));
        }
        check_email(&email)?;

        let now = now_ms();
        let id = Ulid::new();
        self.store
            .insert_customer(Customer {
                id,
                name,
                company,
                email,
                max_source_limit: DEFAULT_MAX_SOURCE_LIMIT,
                created_at: now,
                updated_at: now,
            })
            .await?;
        info!(%id, "customer created");
        Ok(id)
    }

    pub async fn update_customer(&self, id: Ulid, patch: CustomerPatch) -> Result<Ulid, EngineError> {
        let _guard = self.customer_locks.lock(id).await;
        let mut customer = self
            .store
            .get_customer(id)
            .await
            .ok_or(EngineError::NotFound("customer", id))?;

        if let Some(name) = replacement(patch.name) {
            check_name(&name, "name is required")?;
            customer.name = name;
        }
        if let Some(company) = replacement(patch.company) {
            if company.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("company too long"));
            }
            customer.company = company;
        }
        if let Some(email) = replacement(patch.email) {
            check_email(&email)?;
            customer.email = email;
        }
        if let Some(limit) = patch.max_source_limit {
            customer.max_source_limit = u32::try_from(limit)
                .map_err(|_| EngineError::InvalidInput("max_source_limit must be between 0 and 4294967295"))?;
        }

        customer.updated_at = now_ms();
        self.store.update_customer(customer).await?;
        debug!(%id, "customer updated");
        Ok(id)
    }

    /// Unconditional; takes the customer's secret, tokens and sources with it.
    pub async fn delete_customer(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _guard = self.customer_locks.lock(id).await;
        for source_id in self.owned_source_ids(id).await {
            self.delete_source(source_id).await?;
        }
        self.store.delete_customer(id).await?;
        self.customer_locks.forget(&id);
        info!(%id, "customer deleted");
        Ok(id)
    }

    async fn owned_source_ids(&self, customer_id: Ulid) -> Vec<Ulid> {
        let filter = SourceFilter {
            customer_id: Some(customer_id),
            ..Default::default()
        };
        let mut ids = Vec::new();
        let mut page = PageRequest {
            page: 1,
            size: MAX_PAGE_SIZE,
        };
        loop {
            let batch = self.store.filter_sources(&filter, page).await;
            ids.extend(batch.content.iter().map(|s| s.id));
            if ids.len() as u64 >= batch.total || batch.content.is_empty() {
                return ids;
            }
            page.page += 1;
        }
    }

    // ── Sources ──────────────────────────────────────────────

    pub async fn create_source(
        &self,
        customer_id: Ulid,
        name: String,
        max_possible_duration: String,
    ) -> Result<Ulid, EngineError> {
        check_name(&name, "name is required")?;
        if self.store.get_customer(customer_id).await.is_none() {
            return Err(EngineError::NotFound("customer", customer_id));
        }
        Policy::parse(&max_possible_duration)?;

        let _guard = self.customer_locks.lock(customer_id).await;
        let customer = self
            .store
            .get_customer(customer_id)
            .await
            .ok_or(EngineError::NotFound("customer", customer_id))?;
        if self.store.count_sources(customer_id).await >= customer.max_source_limit as usize {
            return Err(EngineError::LimitExceeded("source limit reached"));
        }

        let now = now_ms();
        let id = Ulid::new();
        self.store
            .insert_source(Source {
                id,
                name,
                max_possible_duration: max_possible_duration.trim().to_string(),
                customer_id,
                created_at: now,
                updated_at: now,
            })
            .await?;
        info!(%id, %customer_id, "source created");
        Ok(id)
    }

    pub async fn update_source(&self, id: Ulid, patch: SourcePatch) -> Result<Ulid, EngineError> {
        let _guard = self.source_locks.lock(id).await;
        let mut source = self
            .store
            .get_source(id)
            .await
            .ok_or(EngineError::NotFound("source", id))?;

        if let Some(name) = replacement(patch.name) {
            check_name(&name, "name is required")?;
            source.name = name;
        }
        if let Some(policy) = replacement(patch.max_possible_duration) {
            Policy::parse(&policy)?;
            source.max_possible_duration = policy.trim().to_string();
        }

        source.updated_at = now_ms();
        self.store.update_source(source).await?;
        debug!(%id, "source updated");
        Ok(id)
    }

    /// Unconditional; takes the source's reservations and tokens with it.
    pub async fn delete_source(&self, id: Ulid) -> Result<Ulid, EngineError> {
        {
            let _guard = self.source_locks.lock(id).await;
            self.store.delete_source(id).await?;
        }
        self.source_locks.forget(&id);
        info!(%id, "source deleted");
        Ok(id)
    }

    // ── Credentials ──────────────────────────────────────────

    /// Replaces whatever secret the customer held before.
    pub async fn issue_secret(&self, customer_id: Ulid) -> Result<Secret, EngineError> {
        let customer = self
            .store
            .get_customer(customer_id)
            .await
            .ok_or(EngineError::NotFound("customer", customer_id))?;
        let secret = Secret {
            id: Ulid::new(),
            customer_id,
            value: self.hasher.secret_value(&customer.company),
            created_at: now_ms(),
        };
        self.store.put_secret(secret.clone()).await?;
        info!(%customer_id, secret_id = %secret.id, "secret issued");
        Ok(secret)
    }

    pub async fn issue_token(&self, customer_id: Ulid, source_id: Ulid) -> Result<ApiToken, EngineError> {
        if self.store.get_customer(customer_id).await.is_none() {
            return Err(EngineError::NotFound("customer", customer_id));
        }
        let _guard = self.source_locks.lock(source_id).await;
        match self.store.get_source(source_id).await {
            Some(source) if source.customer_id == customer_id => {}
            _ => return Err(EngineError::NotFound("source", source_id)),
        }
        let secret = self
            .store
            .secret_for_customer(customer_id)
            .await
            .ok_or(EngineError::NotFound("secret", customer_id))?;

        let now = now_ms();
        let token = ApiToken {
            id: Ulid::new(),
            customer_id,
            source_id,
            value: self.hasher.token_value(&secret.value),
            valid_until: now.saturating_add(TOKEN_TTL_MS),
            created_at: now,
        };
        self.store.insert_token(token.clone()).await?;
        info!(%customer_id, %source_id, token_id = %token.id, "token issued");
        Ok(token)
    }

    /// Revoke every token whose validity ended at or before `now`.
    pub async fn sweep_expired_tokens(&self, now: Ms) -> Result<usize, EngineError> {
        let expired = self.store.expired_tokens(now).await;
        for id in &expired {
            self.store.delete_token(*id).await?;
        }
        Ok(expired.len())
    }
}
