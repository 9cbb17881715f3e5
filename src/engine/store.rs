use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

type SlotKey = (String, NaiveDateTime);

/// In-memory record keeper, rebuilt from the WAL on startup.
///
/// Every query in here is a plain read; the engine decides what to write.
pub struct AppointmentStore {
    rows: DashMap<Ulid, Appointment>,
    /// Calendar day → appointments whose `date_time` falls on it.
    by_day: DashMap<NaiveDate, Vec<Ulid>>,
    /// (veterinarian, date_time) → the Active appointment occupying that slot.
    active_slots: DashMap<SlotKey, Ulid>,
}

impl Default for AppointmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AppointmentStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            by_day: DashMap::new(),
            active_slots: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    // ── Writes ───────────────────────────────────────────────

    /// Insert if the id is unknown, otherwise replace the stored row.
    /// `created_at` of an existing row always wins over the incoming one.
    pub fn save(&self, mut appointment: Appointment) -> Appointment {
        let existing = self.rows.get(&appointment.id).map(|e| e.value().clone());
        if let Some(existing) = existing {
            appointment.created_at = existing.created_at;
            self.unindex(&existing);
        }
        self.index(&appointment);
        self.rows.insert(appointment.id, appointment.clone());
        appointment
    }

    /// Flip a row to `Cancelled`, stamping `cancelled_at`. Re-stamps rows
    /// that are already cancelled.
    pub fn mark_cancelled(&self, id: &Ulid, at: NaiveDateTime) -> Option<Appointment> {
        let mut row = self.find_by_id(id)?;
        row.status = Status::Cancelled;
        row.cancelled_at = Some(at);
        Some(self.save(row))
    }

    pub fn apply_event(&self, event: &Event) -> Option<Appointment> {
        match event {
            Event::AppointmentBooked(a)
            | Event::AppointmentModified(a)
            | Event::AppointmentRestored(a) => Some(self.save(a.clone())),
            Event::AppointmentCancelled { id, cancelled_at } => {
                self.mark_cancelled(id, *cancelled_at)
            }
        }
    }

    /// `Err(holder)` when an Active appointment other than this one already
    /// occupies its (veterinarian, date_time).
    pub fn ensure_slot_free(&self, appointment: &Appointment) -> Result<(), Ulid> {
        let key = (appointment.veterinarian.clone(), appointment.date_time);
        match self.active_slots.get(&key) {
            Some(holder) if *holder.value() != appointment.id => Err(*holder.value()),
            _ => Ok(()),
        }
    }

    fn index(&self, appointment: &Appointment) {
        self.by_day
            .entry(appointment.day())
            .or_default()
            .push(appointment.id);
        if appointment.is_active() {
            self.active_slots.insert(
                (appointment.veterinarian.clone(), appointment.date_time),
                appointment.id,
            );
        }
    }

    fn unindex(&self, appointment: &Appointment) {
        if let Some(mut ids) = self.by_day.get_mut(&appointment.day()) {
            ids.retain(|id| id != &appointment.id);
        }
        let key = (appointment.veterinarian.clone(), appointment.date_time);
        self.active_slots
            .remove_if(&key, |_, holder| *holder == appointment.id);
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn find_by_id(&self, id: &Ulid) -> Option<Appointment> {
        self.rows.get(id).map(|e| e.value().clone())
    }

    fn on_day(&self, day: NaiveDate) -> Vec<Appointment> {
        let ids = self
            .by_day
            .get(&day)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.find_by_id(id)).collect()
    }

    pub fn find_by_veterinarian_and_date_time_and_status(
        &self,
        veterinarian: &str,
        date_time: NaiveDateTime,
        status: Status,
    ) -> Vec<Appointment> {
        self.on_day(date_time.date())
            .into_iter()
            .filter(|a| {
                a.status == status && a.date_time == date_time && a.veterinarian == veterinarian
            })
            .collect()
    }

    /// Active appointments at `date_time` whose species is in `species`
    /// (case-insensitive).
    pub fn find_by_species_set_and_date_time(
        &self,
        species: &[&str],
        date_time: NaiveDateTime,
    ) -> Vec<Appointment> {
        self.on_day(date_time.date())
            .into_iter()
            .filter(|a| {
                a.is_active()
                    && a.date_time == date_time
                    && species
                        .iter()
                        .any(|s| s.eq_ignore_ascii_case(a.species.trim()))
            })
            .collect()
    }

    /// Active appointments for `owner` on the calendar day `date`.
    pub fn count_by_owner_and_date(&self, owner: &str, date: NaiveDate) -> usize {
        self.on_day(date)
            .iter()
            .filter(|a| a.is_active() && a.owner_name == owner)
            .count()
    }

    /// A veterinarian's Active appointments for one day, earliest first.
    pub fn find_active_by_veterinarian_and_date(
        &self,
        veterinarian: &str,
        date: NaiveDate,
    ) -> Vec<Appointment> {
        let mut day: Vec<_> = self
            .on_day(date)
            .into_iter()
            .filter(|a| a.is_active() && a.veterinarian == veterinarian)
            .collect();
        day.sort_by_key(|a| a.date_time);
        day
    }

    pub fn find_all_ordered_by_date_time_desc(&self) -> Vec<Appointment> {
        let mut all: Vec<_> = self.rows.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.date_time.cmp(&a.date_time).then(b.id.cmp(&a.id)));
        all
    }

    /// Cancelled rows with `cancelled_at` in `[start, end]`, latest first.
    pub fn find_cancelled_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Vec<Appointment> {
        let mut hits: Vec<_> = self
            .rows
            .iter()
            .filter(|e| {
                let a = e.value();
                a.status == Status::Cancelled
                    && a.cancelled_at.is_some_and(|at| start <= at && at <= end)
            })
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by(|a, b| b.cancelled_at.cmp(&a.cancelled_at));
        hits
    }

    /// Every row in creation order. Used to snapshot the WAL.
    pub fn snapshot(&self) -> Vec<Appointment> {
        let mut all: Vec<_> = self.rows.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").unwrap()
    }

    fn appt(vet: &str, owner: &str, species: &str, when: &str) -> Appointment {
        Appointment::book(
            Ulid::new(),
            AppointmentDraft {
                animal_name: "Rex".into(),
                species: species.into(),
                owner_name: owner.into(),
                phone: "5551234567".into(),
                veterinarian: vet.into(),
                date_time: at(when),
            },
            at("2099-01-01T00:00"),
        )
    }

    #[test]
    fn save_preserves_created_at() {
        let store = AppointmentStore::new();
        let a = store.save(appt("A", "Jane", "Dog", "2099-06-01T10:00"));

        let mut edited = a.clone();
        edited.created_at = at("2099-05-05T05:05");
        edited.status = Status::Modified;
        let stored = store.save(edited);

        assert_eq!(stored.created_at, a.created_at);
        assert_eq!(store.find_by_id(&a.id).unwrap().created_at, a.created_at);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn vet_lookup_matches_exact_time_and_status() {
        let store = AppointmentStore::new();
        let a = store.save(appt("A", "Jane", "Dog", "2099-06-01T10:00"));
        store.save(appt("B", "Tom", "Bird", "2099-06-01T10:00"));
        store.save(appt("A", "Tom", "Bird", "2099-06-01T10:30"));

        let hits = store.find_by_veterinarian_and_date_time_and_status(
            "A",
            at("2099-06-01T10:00"),
            Status::Active,
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a.id);

        let none = store.find_by_veterinarian_and_date_time_and_status(
            "A",
            at("2099-06-01T10:00"),
            Status::Cancelled,
        );
        assert!(none.is_empty());
    }

    #[test]
    fn rescheduling_moves_day_index() {
        let store = AppointmentStore::new();
        let a = store.save(appt("A", "Jane", "Dog", "2099-06-01T10:00"));

        let mut moved = a.clone();
        moved.date_time = at("2099-06-02T10:00");
        store.save(moved);

        let day1 = NaiveDate::from_ymd_opt(2099, 6, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2099, 6, 2).unwrap();
        assert_eq!(store.count_by_owner_and_date("Jane", day1), 0);
        assert_eq!(store.count_by_owner_and_date("Jane", day2), 1);
    }

    #[test]
    fn species_lookup_is_case_insensitive_and_active_only() {
        let store = AppointmentStore::new();
        store.save(appt("A", "Jane", "DOG", "2099-06-01T10:00"));
        let cat = store.save(appt("B", "Tom", "cat", "2099-06-01T10:00"));
        store.save(appt("C", "Ann", "Bird", "2099-06-01T10:00"));
        store.mark_cancelled(&cat.id, at("2099-01-02T00:00"));

        let hits = store.find_by_species_set_and_date_time(&["dog", "cat"], at("2099-06-01T10:00"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].species, "DOG");
    }

    #[test]
    fn owner_count_ignores_other_days_and_statuses() {
        let store = AppointmentStore::new();
        store.save(appt("A", "Jane", "Dog", "2099-06-01T10:00"));
        let b = store.save(appt("B", "Jane", "Bird", "2099-06-01T15:00"));
        store.save(appt("A", "Jane", "Dog", "2099-06-02T10:00"));
        store.save(appt("A", "Tom", "Dog", "2099-06-01T11:00"));

        let day = NaiveDate::from_ymd_opt(2099, 6, 1).unwrap();
        assert_eq!(store.count_by_owner_and_date("Jane", day), 2);

        store.mark_cancelled(&b.id, at("2099-01-02T00:00"));
        assert_eq!(store.count_by_owner_and_date("Jane", day), 1);
    }

    #[test]
    fn slot_claim_released_when_no_longer_active() {
        let store = AppointmentStore::new();
        let a = store.save(appt("A", "Jane", "Dog", "2099-06-01T10:00"));

        let rival = appt("A", "Tom", "Bird", "2099-06-01T10:00");
        assert_eq!(store.ensure_slot_free(&rival), Err(a.id));
        // The holder itself never conflicts with its own slot
        assert_eq!(store.ensure_slot_free(&a), Ok(()));

        store.mark_cancelled(&a.id, at("2099-01-02T00:00"));
        assert_eq!(store.ensure_slot_free(&rival), Ok(()));
    }

    #[test]
    fn all_ordered_by_date_time_desc() {
        let store = AppointmentStore::new();
        store.save(appt("A", "Jane", "Dog", "2099-06-01T10:00"));
        store.save(appt("A", "Jane", "Dog", "2099-06-03T10:00"));
        store.save(appt("A", "Jane", "Dog", "2099-06-02T10:00"));

        let times: Vec<_> = store
            .find_all_ordered_by_date_time_desc()
            .iter()
            .map(|a| a.date_time)
            .collect();
        assert_eq!(
            times,
            vec![
                at("2099-06-03T10:00"),
                at("2099-06-02T10:00"),
                at("2099-06-01T10:00")
            ]
        );
    }

    #[test]
    fn cancelled_range_is_inclusive_and_latest_first() {
        let store = AppointmentStore::new();
        let a = store.save(appt("A", "Jane", "Dog", "2099-06-01T10:00"));
        let b = store.save(appt("B", "Tom", "Dog", "2099-06-01T11:00"));
        let c = store.save(appt("C", "Ann", "Dog", "2099-06-01T12:00"));
        store.save(appt("D", "Bob", "Dog", "2099-06-01T13:00"));

        store.mark_cancelled(&a.id, at("2099-02-01T00:00"));
        store.mark_cancelled(&b.id, at("2099-02-10T00:00"));
        store.mark_cancelled(&c.id, at("2099-03-01T00:00"));

        let hits = store.find_cancelled_in_range(at("2099-02-01T00:00"), at("2099-02-10T00:00"));
        let ids: Vec<_> = hits.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[test]
    fn agenda_is_earliest_first() {
        let store = AppointmentStore::new();
        store.save(appt("A", "Jane", "Dog", "2099-06-01T15:00"));
        store.save(appt("A", "Tom", "Dog", "2099-06-01T09:00"));
        store.save(appt("B", "Ann", "Dog", "2099-06-01T10:00"));

        let day = NaiveDate::from_ymd_opt(2099, 6, 1).unwrap();
        let agenda = store.find_active_by_veterinarian_and_date("A", day);
        assert_eq!(agenda.len(), 2);
        assert_eq!(agenda[0].date_time, at("2099-06-01T09:00"));
        assert_eq!(agenda[1].date_time, at("2099-06-01T15:00"));
    }
}
