use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::RESERVATION_REJECTIONS_TOTAL;
use crate::policy::Policy;
use crate::store::OverlapQuery;

use super::validator::{Candidate, Verdict, validate};
use super::{Engine, EngineError};

fn check_participant(value: &str, field: &'static str) -> Result<(), EngineError> {
    if value.is_empty() {
        return Err(EngineError::InvalidInput(field));
    }
    if value.len() > MAX_PARTICIPANT_ID_LEN {
        return Err(EngineError::LimitExceeded("participant id too long"));
    }
    Ok(())
}

fn check_timestamps(from: Ms, to: Ms) -> Result<(), EngineError> {
    let in_range = |t: Ms| (MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t);
    if !in_range(from) || !in_range(to) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

impl Engine {
    /// Overlap set for a candidate window. An empty or inverted window has
    /// none; the validator rejects it on shape alone.
    async fn overlaps_for(
        &self,
        source_id: Ulid,
        from: Ms,
        to: Ms,
        reserver_id: &str,
        reservee_id: &str,
        matching: ParticipantMatch,
    ) -> Vec<Reservation> {
        let Some(span) = Span::try_new(from, to) else {
            return Vec::new();
        };
        self.store
            .overlapping(&OverlapQuery {
                source_id,
                span,
                reserver_id,
                reservee_id,
                matching,
            })
            .await
    }

    fn decide(&self, candidate: &Candidate, policy: &Policy, overlaps: &[Reservation]) -> Result<(), EngineError> {
        match validate(candidate, policy, overlaps) {
            Verdict::Accept => Ok(()),
            Verdict::Reject(rejection) => {
                metrics::counter!(RESERVATION_REJECTIONS_TOTAL, "reason" => rejection.label())
                    .increment(1);
                debug!(?rejection, "reservation rejected");
                Err(rejection.into())
            }
        }
    }

    pub async fn create_reservation(&self, new: NewReservation) -> Result<Ulid, EngineError> {
        check_participant(&new.reserver_id, "reserver_id is required")?;
        check_participant(&new.reservee_id, "reservee_id is required")?;
        check_timestamps(new.from, new.to)?;

        let source = self
            .store
            .get_source(new.source_id)
            .await
            .ok_or(EngineError::NotFound("source", new.source_id))?;
        Policy::for_source(&source)?;

        let _guard = self.source_locks.lock(source.id).await;
        // Re-read under the lock: the source may have been deleted or its
        // policy changed while we waited.
        let source = self
            .store
            .get_source(new.source_id)
            .await
            .ok_or(EngineError::NotFound("source", new.source_id))?;
        let policy = Policy::for_source(&source)?;
        if self.store.count_reservations(source.id).await >= MAX_RESERVATIONS_PER_SOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on source"));
        }

        let overlaps = self
            .overlaps_for(
                source.id,
                new.from,
                new.to,
                &new.reserver_id,
                &new.reservee_id,
                self.options.create_match,
            )
            .await;
        let candidate = Candidate {
            from: new.from,
            to: new.to,
            exclude_id: None,
        };
        self.decide(&candidate, &policy, &overlaps)?;

        let now = now_ms();
        let id = Ulid::new();
        self.store
            .insert_reservation(Reservation {
                id,
                from: new.from,
                to: new.to,
                source_id: source.id,
                reserver_id: new.reserver_id,
                reservee_id: new.reservee_id,
                created_at: now,
                updated_at: now,
            })
            .await?;
        debug!(%id, source_id = %source.id, "reservation created");
        Ok(id)
    }

    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Ulid, EngineError> {
        let source_id = self
            .store
            .get_reservation(id)
            .await
            .ok_or(EngineError::NotFound("reservation", id))?
            .source_id;

        let _guard = self.source_locks.lock(source_id).await;
        let mut reservation = self
            .store
            .get_reservation(id)
            .await
            .ok_or(EngineError::NotFound("reservation", id))?;
        let source = self
            .store
            .get_source(source_id)
            .await
            .ok_or(EngineError::NotFound("source", source_id))?;
        let policy = Policy::for_source(&source)?;

        patch.apply(&mut reservation);
        check_timestamps(reservation.from, reservation.to)?;

        let overlaps = self
            .overlaps_for(
                source_id,
                reservation.from,
                reservation.to,
                &reservation.reserver_id,
                &reservation.reservee_id,
                self.options.update_match,
            )
            .await;
        let candidate = Candidate {
            from: reservation.from,
            to: reservation.to,
            exclude_id: Some(id),
        };
        self.decide(&candidate, &policy, &overlaps)?;

        reservation.updated_at = now_ms();
        self.store.update_reservation(reservation).await?;
        debug!(%id, %source_id, "reservation updated");
        Ok(id)
    }

    /// Unconditional. Deleting an unknown id is a successful no-op.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let Some(reservation) = self.store.get_reservation(id).await else {
            debug!(%id, existed = false, "reservation deleted");
            return Ok(id);
        };
        let _guard = self.source_locks.lock(reservation.source_id).await;
        let existed = self.store.delete_reservation(id).await?;
        debug!(%id, existed, "reservation deleted");
        Ok(id)
    }
}
