use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub fn get(&self, id: Ulid) -> Option<Appointment> {
        self.store.find_by_id(&id)
    }

    /// Every appointment, any status, latest `date_time` first.
    pub fn list_all(&self) -> Vec<Appointment> {
        self.store.find_all_ordered_by_date_time_desc()
    }

    /// Cancelled appointments with `cancelled_at` in `[start, end]`, latest
    /// cancellation first.
    pub fn list_cancelled(&self, start: NaiveDateTime, end: NaiveDateTime) -> Vec<Appointment> {
        self.store.find_cancelled_in_range(start, end)
    }

    /// Active appointments of one veterinarian on one day, earliest first.
    pub fn agenda(&self, veterinarian: &str, date: NaiveDate) -> Vec<Appointment> {
        self.store
            .find_active_by_veterinarian_and_date(veterinarian, date)
    }

    /// Rewrite the WAL as one `AppointmentRestored` per stored row.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Hold the gate so no mutation lands between snapshot and swap.
        let _gate = self.commit_gate.lock().await;
        let events: Vec<Event> = self
            .store
            .snapshot()
            .into_iter()
            .map(Event::AppointmentRestored)
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
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
