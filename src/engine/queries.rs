use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn check_page(page: PageRequest, ids: &[Ulid]) -> Result<PageRequest, EngineError> {
    if page.page == 0 {
        return Err(EngineError::InvalidInput("page is 1-indexed"));
    }
    if page.size == 0 {
        return Err(EngineError::InvalidInput("size must be at least 1"));
    }
    if ids.len() > MAX_IN_CLAUSE_IDS {
        return Err(EngineError::LimitExceeded("too many ids in IN list"));
    }
    Ok(PageRequest {
        page: page.page,
        size: page.size.min(MAX_PAGE_SIZE),
    })
}

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store
            .get_reservation(id)
            .await
            .ok_or(EngineError::NotFound("reservation", id))
    }

    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
        page: PageRequest,
    ) -> Result<Page<Reservation>, EngineError> {
        let page = check_page(page, &filter.ids)?;
        Ok(self.store.filter_reservations(filter, page).await)
    }

    pub async fn get_source(&self, id: Ulid) -> Result<Source, EngineError> {
        self.store
            .get_source(id)
            .await
            .ok_or(EngineError::NotFound("source", id))
    }

    pub async fn list_sources(
        &self,
        filter: &SourceFilter,
        page: PageRequest,
    ) -> Result<Page<Source>, EngineError> {
        let page = check_page(page, &filter.ids)?;
        Ok(self.store.filter_sources(filter, page).await)
    }

    pub async fn get_customer(&self, id: Ulid) -> Result<Customer, EngineError> {
        self.store
            .get_customer(id)
            .await
            .ok_or(EngineError::NotFound("customer", id))
    }

    pub async fn list_customers(
        &self,
        filter: &CustomerFilter,
        page: PageRequest,
    ) -> Result<Page<Customer>, EngineError> {
        let page = check_page(page, &filter.ids)?;
        Ok(self.store.filter_customers(filter, page).await)
    }
}
