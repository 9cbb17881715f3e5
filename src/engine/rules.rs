use chrono::{Local, NaiveDateTime, TimeDelta};
use ulid::Ulid;

use crate::catalog::{INCOMPATIBLE_SPECIES, is_incompatible_species};
use crate::limits::*;
use crate::model::*;

use super::store::AppointmentStore;
use super::ValidationError;

/// Clinic wall-clock time. Appointments carry no zone.
pub(crate) fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Rule 1: the veterinarian must not already have an Active appointment at
/// exactly `date_time`. `exclude` skips the record being edited.
pub(crate) fn check_veterinarian_slot(
    store: &AppointmentStore,
    veterinarian: &str,
    date_time: NaiveDateTime,
    exclude: Option<Ulid>,
) -> Result<(), ValidationError> {
    let taken = store
        .find_by_veterinarian_and_date_time_and_status(veterinarian, date_time, Status::Active)
        .into_iter()
        .any(|a| Some(a.id) != exclude);
    if taken {
        let suggested = suggest_available_time(store, veterinarian, date_time);
        return Err(ValidationError::SlotConflict { suggested });
    }
    Ok(())
}

/// Rule 2: dogs and cats never share a timestamp, whoever the veterinarian.
pub(crate) fn check_species(
    store: &AppointmentStore,
    draft: &AppointmentDraft,
) -> Result<(), ValidationError> {
    if !is_incompatible_species(&draft.species) {
        return Ok(());
    }
    let clashes = store.find_by_species_set_and_date_time(INCOMPATIBLE_SPECIES, draft.date_time);
    if !clashes.is_empty() {
        return Err(ValidationError::SpeciesConflict);
    }
    Ok(())
}

/// Rule 3: at most two Active appointments per owner per calendar day.
pub(crate) fn check_owner_limit(
    store: &AppointmentStore,
    draft: &AppointmentDraft,
) -> Result<(), ValidationError> {
    let date = draft.date_time.date();
    if store.count_by_owner_and_date(&draft.owner_name, date) >= MAX_ACTIVE_PER_OWNER_PER_DAY {
        return Err(ValidationError::OwnerLimitExceeded {
            owner: draft.owner_name.clone(),
            date,
        });
    }
    Ok(())
}

/// First 30-minute step after `from` where the veterinarian is free.
///
/// No lookahead bound: the scan ends because the store holds finitely many
/// Active appointments.
pub(crate) fn suggest_available_time(
    store: &AppointmentStore,
    veterinarian: &str,
    from: NaiveDateTime,
) -> NaiveDateTime {
    let step = TimeDelta::minutes(SLOT_STEP_MINUTES);
    let mut candidate = from + step;
    loop {
        let taken = store.find_by_veterinarian_and_date_time_and_status(
            veterinarian,
            candidate,
            Status::Active,
        );
        if taken.is_empty() {
            return candidate;
        }
        candidate += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").unwrap()
    }

    fn draft(vet: &str, owner: &str, species: &str, when: &str) -> AppointmentDraft {
        AppointmentDraft {
            animal_name: "Rex".into(),
            species: species.into(),
            owner_name: owner.into(),
            phone: "5551234567".into(),
            veterinarian: vet.into(),
            date_time: at(when),
        }
    }

    fn seed(store: &AppointmentStore, d: AppointmentDraft) -> Appointment {
        store.save(Appointment::book(Ulid::new(), d, at("2099-01-01T00:00")))
    }

    #[test]
    fn suggestion_skips_consecutive_taken_slots() {
        let store = AppointmentStore::new();
        seed(&store, draft("A", "x", "Bird", "2099-06-01T10:00"));
        seed(&store, draft("A", "y", "Bird", "2099-06-01T10:30"));
        seed(&store, draft("A", "z", "Bird", "2099-06-01T11:00"));
        // Another vet's appointment does not matter
        seed(&store, draft("B", "w", "Bird", "2099-06-01T11:30"));

        assert_eq!(
            suggest_available_time(&store, "A", at("2099-06-01T10:00")),
            at("2099-06-01T11:30")
        );
    }

    #[test]
    fn suggestion_crosses_midnight() {
        let store = AppointmentStore::new();
        seed(&store, draft("A", "x", "Bird", "2099-06-01T23:30"));
        seed(&store, draft("A", "y", "Bird", "2099-06-02T00:00"));

        assert_eq!(
            suggest_available_time(&store, "A", at("2099-06-01T23:00")),
            at("2099-06-02T00:30")
        );
    }

    #[test]
    fn slot_check_excludes_record_being_edited() {
        let store = AppointmentStore::new();
        let a = seed(&store, draft("A", "x", "Bird", "2099-06-01T10:00"));

        assert!(check_veterinarian_slot(&store, "A", a.date_time, Some(a.id)).is_ok());
        assert_eq!(
            check_veterinarian_slot(&store, "A", a.date_time, None),
            Err(ValidationError::SlotConflict {
                suggested: at("2099-06-01T10:30")
            })
        );
    }

    #[test]
    fn other_species_never_clash() {
        let store = AppointmentStore::new();
        seed(&store, draft("A", "x", "Dog", "2099-06-01T10:00"));

        assert!(check_species(&store, &draft("B", "y", "Bird", "2099-06-01T10:00")).is_ok());
        assert_eq!(
            check_species(&store, &draft("B", "y", "Cat", "2099-06-01T10:00")),
            Err(ValidationError::SpeciesConflict)
        );
        assert!(check_species(&store, &draft("B", "y", "Cat", "2099-06-01T10:30")).is_ok());
    }

    #[test]
    fn owner_limit_counts_active_only() {
        let store = AppointmentStore::new();
        seed(&store, draft("A", "Jane", "Bird", "2099-06-01T09:00"));
        let second = seed(&store, draft("B", "Jane", "Bird", "2099-06-01T12:00"));

        let third = draft("C", "Jane", "Bird", "2099-06-01T17:00");
        assert!(matches!(
            check_owner_limit(&store, &third),
            Err(ValidationError::OwnerLimitExceeded { .. })
        ));

        store.mark_cancelled(&second.id, at("2099-01-02T00:00"));
        assert!(check_owner_limit(&store, &third).is_ok());
    }
}
