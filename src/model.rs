use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;

/// Lifecycle state. `Active` is the only state that can be edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Active,
    Modified,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "ACTIVE",
            Status::Modified => "MODIFIED",
            Status::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Status::Active),
            "MODIFIED" => Ok(Status::Modified),
            "CANCELLED" => Ok(Status::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// A booking request as submitted by a client: no id, no status, no stamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentDraft {
    pub animal_name: String,
    pub species: String,
    pub owner_name: String,
    pub phone: String,
    pub veterinarian: String,
    pub date_time: NaiveDateTime,
}

impl AppointmentDraft {
    /// Field-level checks run before any schedule rule.
    pub fn validate(&self, now: NaiveDateTime) -> Result<(), FieldError> {
        let text_fields = [
            ("animal_name", &self.animal_name),
            ("species", &self.species),
            ("owner_name", &self.owner_name),
            ("phone", &self.phone),
            ("veterinarian", &self.veterinarian),
        ];
        for (name, value) in text_fields {
            if value.trim().is_empty() {
                return Err(FieldError::Blank(name));
            }
            if value.len() > MAX_FIELD_LEN {
                return Err(FieldError::TooLong(name));
            }
        }
        if self.phone.len() != PHONE_DIGITS || !self.phone.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FieldError::InvalidPhone);
        }
        if self.date_time <= now {
            return Err(FieldError::NotInFuture);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub animal_name: String,
    pub species: String,
    pub owner_name: String,
    pub phone: String,
    pub veterinarian: String,
    pub date_time: NaiveDateTime,
    pub status: Status,
    pub created_at: NaiveDateTime,
    pub modified_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
}

impl Appointment {
    /// Fresh `Active` record for a validated draft.
    pub fn book(id: Ulid, draft: AppointmentDraft, now: NaiveDateTime) -> Self {
        Self {
            id,
            animal_name: draft.animal_name,
            species: draft.species,
            owner_name: draft.owner_name,
            phone: draft.phone,
            veterinarian: draft.veterinarian,
            date_time: draft.date_time,
            status: Status::Active,
            created_at: now,
            modified_at: None,
            cancelled_at: None,
        }
    }

    /// Replacement record for an edit: keeps id and `created_at`, takes every
    /// field from the draft.
    pub fn modified_from(&self, draft: AppointmentDraft, now: NaiveDateTime) -> Self {
        Self {
            id: self.id,
            animal_name: draft.animal_name,
            species: draft.species,
            owner_name: draft.owner_name,
            phone: draft.phone,
            veterinarian: draft.veterinarian,
            date_time: draft.date_time,
            status: Status::Modified,
            created_at: self.created_at,
            modified_at: Some(now),
            cancelled_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    pub fn day(&self) -> NaiveDate {
        self.date_time.date()
    }
}

/// Inclusive bounds of a report covering whole days, `00:00:00` to `23:59:59`.
pub fn day_bounds(first: NaiveDate, last: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = first.and_time(NaiveTime::MIN);
    let end = last.and_time(NaiveTime::MIN) + TimeDelta::seconds(86_399);
    (start, end)
}

/// WAL record format, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentBooked(Appointment),
    AppointmentModified(Appointment),
    AppointmentCancelled {
        id: Ulid,
        cancelled_at: NaiveDateTime,
    },
    /// Full record, written only by WAL compaction.
    AppointmentRestored(Appointment),
}

impl Event {
    pub fn appointment_id(&self) -> Ulid {
        match self {
            Event::AppointmentBooked(a)
            | Event::AppointmentModified(a)
            | Event::AppointmentRestored(a) => a.id,
            Event::AppointmentCancelled { id, .. } => *id,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    Blank(&'static str),
    TooLong(&'static str),
    InvalidPhone,
    NotInFuture,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldError::Blank(field) => write!(f, "{field} is required"),
            FieldError::TooLong(field) => {
                write!(f, "{field} exceeds {MAX_FIELD_LEN} bytes")
            }
            FieldError::InvalidPhone => write!(f, "phone must be exactly {PHONE_DIGITS} digits"),
            FieldError::NotInFuture => write!(f, "date_time must be in the future"),
        }
    }
}

impl std::error::Error for FieldError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").unwrap()
    }

    fn draft() -> AppointmentDraft {
        AppointmentDraft {
            animal_name: "Rex".into(),
            species: "Dog".into(),
            owner_name: "Jane".into(),
            phone: "5551234567".into(),
            veterinarian: "Dr. Lopez".into(),
            date_time: at("2099-06-01T10:00"),
        }
    }

    #[test]
    fn valid_draft_passes() {
        assert_eq!(draft().validate(at("2099-01-01T00:00")), Ok(()));
    }

    #[test]
    fn blank_fields_rejected() {
        let now = at("2099-01-01T00:00");
        let mut d = draft();
        d.owner_name = "   ".into();
        assert_eq!(d.validate(now), Err(FieldError::Blank("owner_name")));

        let mut d = draft();
        d.animal_name = String::new();
        assert_eq!(d.validate(now), Err(FieldError::Blank("animal_name")));
    }

    #[test]
    fn phone_must_be_ten_digits() {
        let now = at("2099-01-01T00:00");
        for bad in ["555123456", "55512345678", "555-123-456", "55512345a7"] {
            let mut d = draft();
            d.phone = bad.into();
            assert_eq!(d.validate(now), Err(FieldError::InvalidPhone), "{bad}");
        }
    }

    #[test]
    fn date_time_must_be_strictly_future() {
        let d = draft();
        assert_eq!(d.validate(d.date_time), Err(FieldError::NotInFuture));
        assert_eq!(d.validate(at("2099-07-01T00:00")), Err(FieldError::NotInFuture));
    }

    #[test]
    fn overlong_field_rejected() {
        let mut d = draft();
        d.veterinarian = "x".repeat(MAX_FIELD_LEN + 1);
        assert_eq!(
            d.validate(at("2099-01-01T00:00")),
            Err(FieldError::TooLong("veterinarian"))
        );
    }

    #[test]
    fn book_starts_active() {
        let now = at("2099-01-01T00:00");
        let a = Appointment::book(Ulid::new(), draft(), now);
        assert_eq!(a.status, Status::Active);
        assert_eq!(a.created_at, now);
        assert!(a.modified_at.is_none());
        assert!(a.cancelled_at.is_none());
    }

    #[test]
    fn modified_keeps_id_and_created_at() {
        let created = at("2099-01-01T00:00");
        let original = Appointment::book(Ulid::new(), draft(), created);
        let mut d = draft();
        d.date_time = at("2099-06-02T11:00");
        let edited_at = at("2099-01-02T09:00");
        let m = original.modified_from(d, edited_at);
        assert_eq!(m.id, original.id);
        assert_eq!(m.created_at, created);
        assert_eq!(m.status, Status::Modified);
        assert_eq!(m.modified_at, Some(edited_at));
        assert!(m.cancelled_at.is_none());
        assert_eq!(m.date_time, at("2099-06-02T11:00"));
    }

    #[test]
    fn status_text_roundtrip() {
        for s in [Status::Active, Status::Modified, Status::Cancelled] {
            assert_eq!(s.as_str().parse::<Status>(), Ok(s));
        }
        assert_eq!("cancelled".parse::<Status>(), Ok(Status::Cancelled));
        assert!("DELETED".parse::<Status>().is_err());
    }

    #[test]
    fn day_bounds_cover_whole_days() {
        let first = NaiveDate::from_ymd_opt(2099, 6, 1).unwrap();
        let last = NaiveDate::from_ymd_opt(2099, 6, 3).unwrap();
        let (start, end) = day_bounds(first, last);
        assert_eq!(start, at("2099-06-01T00:00"));
        assert_eq!(
            end,
            NaiveDateTime::parse_from_str("2099-06-03T23:59:59", "%Y-%m-%dT%H:%M:%S").unwrap()
        );
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked(Appointment::book(
            Ulid::new(),
            draft(),
            at("2099-01-01T00:00"),
        ));
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
