use chrono::NaiveDateTime;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::rules::{check_owner_limit, check_species, check_veterinarian_slot, now};
use super::{Engine, EngineError, ValidationError};

impl Engine {
    /// Book a new appointment. Rules run in order and stop at the first
    /// failure: veterinarian slot, species, owner daily limit.
    pub async fn create(&self, draft: AppointmentDraft) -> Result<Appointment, EngineError> {
        let now = now();
        draft.validate(now)?;
        if self.store.len() >= MAX_APPOINTMENTS {
            return Err(EngineError::LimitExceeded("too many appointments"));
        }

        let checked = check_veterinarian_slot(&self.store, &draft.veterinarian, draft.date_time, None)
            .and_then(|()| check_species(&self.store, &draft))
            .and_then(|()| check_owner_limit(&self.store, &draft));
        if let Err(e) = checked {
            debug!("booking rejected for {}: {e}", draft.owner_name);
            record_rejection(&e);
            return Err(e.into());
        }

        let appointment = Appointment::book(Ulid::new(), draft, now);
        let stored = self
            .commit(Event::AppointmentBooked(appointment))
            .await?;
        info!(
            "booked {} with {} at {}",
            stored.id, stored.veterinarian, stored.date_time
        );
        Ok(stored)
    }

    /// Replace an Active appointment with the draft and mark it `Modified`.
    /// Only the veterinarian slot rule is re-checked.
    pub async fn update(
        &self,
        id: Ulid,
        draft: AppointmentDraft,
    ) -> Result<Appointment, EngineError> {
        let now = now();
        draft.validate(now)?;

        let existing = self
            .store
            .find_by_id(&id)
            .ok_or(ValidationError::NotFound(id))?;
        if existing.status != Status::Active {
            return Err(ValidationError::InvalidState(existing.status).into());
        }

        let modified = existing.modified_from(draft, now);
        if let Err(e) =
            check_veterinarian_slot(&self.store, &modified.veterinarian, modified.date_time, Some(id))
        {
            debug!("update of {id} rejected: {e}");
            record_rejection(&e);
            return Err(e.into());
        }

        let stored = self
            .commit(Event::AppointmentModified(modified))
            .await?;
        info!("modified {id}, now with {} at {}", stored.veterinarian, stored.date_time);
        Ok(stored)
    }

    /// Cancel an appointment in any status. Cancelling twice re-stamps
    /// `cancelled_at`; a `Modified` row keeps its `modified_at`.
    pub async fn cancel(&self, id: Ulid) -> Result<(), EngineError> {
        if self.store.find_by_id(&id).is_none() {
            return Err(ValidationError::NotFound(id).into());
        }

        self.commit(Event::AppointmentCancelled {
            id,
            cancelled_at: now(),
        })
        .await?;
        info!("cancelled {id}");
        Ok(())
    }

    /// First free 30-minute step after `from` for this veterinarian.
    pub fn suggest_available_time(&self, veterinarian: &str, from: NaiveDateTime) -> NaiveDateTime {
        super::rules::suggest_available_time(&self.store, veterinarian, from)
    }
}

fn record_rejection(e: &ValidationError) {
    let reason = match e {
        ValidationError::SlotConflict { .. } => "slot_conflict",
        ValidationError::SpeciesConflict => "species_conflict",
        ValidationError::OwnerLimitExceeded { .. } => "owner_limit",
        ValidationError::NotFound(_) => "not_found",
        ValidationError::InvalidState(_) => "invalid_state",
    };
    metrics::counter!(crate::observability::BOOKINGS_REJECTED_TOTAL, "reason" => reason).increment(1);
}
