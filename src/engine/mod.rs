mod booking;
mod error;
mod queries;
mod rules;
mod store;

pub use error::{EngineError, ValidationError};
pub use store::AppointmentStore;

use std::io;
use std::path::PathBuf;

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::warn;

use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking workflow: validation rules on top of the appointment store,
/// with every accepted change written to the WAL before it is applied.
pub struct Engine {
    pub store: AppointmentStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes slot re-check + WAL append + apply.
    commit_gate: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: AppointmentStore::new(),
            wal_tx,
            commit_gate: Mutex::new(()),
        };

        for event in &events {
            if engine.store.apply_event(event).is_none() {
                warn!("replay: no appointment {} for {event:?}", event.appointment_id());
            }
        }
        metrics::gauge!(crate::observability::APPOINTMENTS_STORED).set(engine.store.len() as f64);

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Status and slot re-check + WAL append + apply, under the commit gate.
    ///
    /// The rules ran earlier without any lock, so two bookings for the same
    /// slot can both pass them; the second one is turned away here. An edit
    /// only lands on a row that is still `Active`.
    pub(super) async fn commit(&self, event: Event) -> Result<Appointment, EngineError> {
        let _gate = self.commit_gate.lock().await;

        if let Event::AppointmentModified(a) = &event {
            let current = self
                .store
                .find_by_id(&a.id)
                .ok_or(ValidationError::NotFound(a.id))?;
            if current.status != Status::Active {
                return Err(ValidationError::InvalidState(current.status).into());
            }
        }

        if let Event::AppointmentBooked(a) | Event::AppointmentModified(a) = &event
            && self.store.ensure_slot_free(a).is_err()
        {
            let suggested = rules::suggest_available_time(&self.store, &a.veterinarian, a.date_time);
            return Err(ValidationError::SlotConflict { suggested }.into());
        }

        self.wal_append(&event).await?;
        let stored = self
            .store
            .apply_event(&event)
            .ok_or(ValidationError::NotFound(event.appointment_id()))?;
        metrics::gauge!(crate::observability::APPOINTMENTS_STORED).set(self.store.len() as f64);
        Ok(stored)
    }
}
