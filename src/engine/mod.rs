mod conflict;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use conflict::{check_no_conflict, conflicts};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};

use crate::model::*;
use crate::store::{StoreError, StoreResult};
use crate::wal::Wal;

pub type SharedFieldState = Arc<RwLock<FieldState>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Every append already queued when the first one arrives shares its fsync.
/// A non-append command ends the batch; the batch is committed before it runs.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All or nothing: on failure the log is rolled back to where the batch
/// began, so no record of a batch whose callers saw an error survives.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let checkpoint = wal.checkpoint();
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        tracing::error!(events = batch.len(), "WAL batch failed, rolling back: {e}");
        if let Err(rollback) = wal.rollback(checkpoint) {
            tracing::error!("WAL rollback failed: {rollback}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            if result.is_ok() {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            }
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Secondary indexes ────────────────────────────────────

/// Lookups that cross field boundaries. Payments live here rather than in
/// `FieldState`, but are only written while the owning field's lock is held.
#[derive(Default)]
pub(super) struct Indexes {
    /// reservation id → field id
    pub(super) reservation_field: DashMap<Id, Id>,
    pub(super) payments: DashMap<Id, Payment>,
    /// reservation id → payment id
    pub(super) payment_by_reservation: DashMap<Id, Id>,
    /// transaction id → payment id
    pub(super) payment_by_transaction: DashMap<String, Id>,
}

impl Indexes {
    fn put_payment(&self, payment: &Payment) {
        if let Some(old) = self.payments.insert(payment.id, payment.clone())
            && old.transaction_id != payment.transaction_id
        {
            self.payment_by_transaction.remove(&old.transaction_id);
        }
        self.payment_by_reservation
            .insert(payment.reservation_id, payment.id);
        self.payment_by_transaction
            .insert(payment.transaction_id.clone(), payment.id);
    }

    fn drop_payment(&self, id: Id) {
        if let Some((_, old)) = self.payments.remove(&id) {
            self.payment_by_reservation.remove(&old.reservation_id);
            self.payment_by_transaction.remove(&old.transaction_id);
        }
    }

    fn forget_reservation(&self, reservation_id: Id) {
        self.reservation_field.remove(&reservation_id);
        let payment_id = self
            .payment_by_reservation
            .get(&reservation_id)
            .map(|e| *e.value());
        if let Some(payment_id) = payment_id {
            self.drop_payment(payment_id);
        }
    }
}

// ── Id sequences ─────────────────────────────────────────

/// Per-entity monotonic counters. Each holds the last id handed out.
#[derive(Default)]
pub(super) struct Sequences {
    pub(super) fields: AtomicI64,
    pub(super) schedules: AtomicI64,
    pub(super) reservations: AtomicI64,
    pub(super) payments: AtomicI64,
}

impl Sequences {
    pub(super) fn next(counter: &AtomicI64) -> Id {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn observe(counter: &AtomicI64, id: Id) {
        counter.fetch_max(id, Ordering::Relaxed);
    }

    /// Raise the counters past every id mentioned by a replayed event.
    fn observe_event(&self, event: &Event) {
        match event {
            Event::FieldCreated { field } | Event::FieldUpdated { field } => {
                Self::observe(&self.fields, field.id)
            }
            Event::FieldDeleted { id } => Self::observe(&self.fields, *id),
            Event::SchedulesReplaced { schedules, .. } => {
                for s in schedules {
                    Self::observe(&self.schedules, s.id);
                }
            }
            Event::ReservationBooked {
                reservation,
                payment,
            }
            | Event::PaymentSettled {
                reservation,
                payment,
            } => {
                Self::observe(&self.reservations, reservation.id);
                Self::observe(&self.payments, payment.id);
            }
            Event::ReservationInserted { reservation }
            | Event::ReservationUpdated { reservation } => {
                Self::observe(&self.reservations, reservation.id)
            }
            Event::ReservationDeleted { id, .. } => Self::observe(&self.reservations, *id),
            Event::PaymentInserted { payment } | Event::PaymentUpdated { payment } => {
                Self::observe(&self.payments, payment.id)
            }
            Event::PaymentDeleted { id } => Self::observe(&self.payments, *id),
            Event::SequenceFloor {
                fields,
                schedules,
                reservations,
                payments,
            } => {
                Self::observe(&self.fields, *fields);
                Self::observe(&self.schedules, *schedules);
                Self::observe(&self.reservations, *reservations);
                Self::observe(&self.payments, *payments);
            }
        }
    }

    fn floor(&self) -> Event {
        Event::SequenceFloor {
            fields: self.fields.load(Ordering::Relaxed),
            schedules: self.schedules.load(Ordering::Relaxed),
            reservations: self.reservations.load(Ordering::Relaxed),
            payments: self.payments.load(Ordering::Relaxed),
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// In-memory store sharded per field, made durable by the WAL.
///
/// Every write to a field's reservations, schedules or payments happens under
/// that field's write lock, and is appended to the WAL before it is applied.
pub struct Engine {
    pub(super) fields: DashMap<Id, SharedFieldState>,
    pub(super) index: Indexes,
    pub(super) seq: Sequences,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot it writes matches everything already in the log.
    pub(super) gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a field-scoped event. The caller holds the field's write lock.
pub(super) fn apply_to_field(fs: &mut FieldState, event: &Event, index: &Indexes) {
    match event {
        Event::FieldUpdated { field } => fs.field = field.clone(),
        Event::SchedulesReplaced { schedules, .. } => fs.schedules = schedules.clone(),
        Event::ReservationBooked {
            reservation,
            payment,
        } => {
            fs.insert_reservation(reservation.clone());
            index
                .reservation_field
                .insert(reservation.id, reservation.field_id);
            index.put_payment(payment);
        }
        Event::ReservationInserted { reservation } => {
            fs.insert_reservation(reservation.clone());
            index
                .reservation_field
                .insert(reservation.id, reservation.field_id);
        }
        Event::ReservationUpdated { reservation } => {
            fs.replace_reservation(reservation.clone());
        }
        Event::PaymentSettled {
            reservation,
            payment,
        } => {
            fs.replace_reservation(reservation.clone());
            index.put_payment(payment);
        }
        Event::ReservationDeleted { id, .. } => {
            fs.remove_reservation(*id);
            index.forget_reservation(*id);
        }
        // Field lifecycle is handled at the map level, payments by `apply_payment`.
        Event::FieldCreated { .. }
        | Event::FieldDeleted { .. }
        | Event::PaymentInserted { .. }
        | Event::PaymentUpdated { .. }
        | Event::PaymentDeleted { .. }
        | Event::SequenceFloor { .. } => {}
    }
}

pub(super) fn apply_payment(event: &Event, index: &Indexes) {
    match event {
        Event::PaymentInserted { payment } | Event::PaymentUpdated { payment } => {
            index.put_payment(payment)
        }
        Event::PaymentDeleted { id } => index.drop_payment(*id),
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let index = Indexes::default();
        let seq = Sequences::default();

        // Replay into owned state first; nothing is shared until it is done.
        let mut replayed: HashMap<Id, FieldState> = HashMap::new();
        for event in &events {
            seq.observe_event(event);
            match event {
                Event::FieldCreated { field } => {
                    replayed.insert(field.id, FieldState::new(field.clone()));
                }
                Event::FieldDeleted { id } => {
                    if let Some(fs) = replayed.remove(id) {
                        for r in &fs.reservations {
                            index.forget_reservation(r.id);
                        }
                    }
                }
                Event::PaymentInserted { .. }
                | Event::PaymentUpdated { .. }
                | Event::PaymentDeleted { .. } => apply_payment(event, &index),
                other => {
                    if let Some(field_id) = other.field_id()
                        && let Some(fs) = replayed.get_mut(&field_id)
                    {
                        apply_to_field(fs, other, &index);
                    }
                }
            }
        }

        let fields = DashMap::with_capacity(replayed.len());
        for (id, fs) in replayed {
            fields.insert(id, Arc::new(RwLock::new(fs)));
        }

        tracing::debug!(
            events = events.len(),
            fields = fields.len(),
            "replayed WAL {}",
            wal_path.display()
        );

        Ok(Self {
            fields,
            index,
            seq,
            gate: RwLock::new(()),
            wal_tx,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> StoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub(super) fn field_state(&self, id: Id) -> Option<SharedFieldState> {
        self.fields.get(&id).map(|e| e.value().clone())
    }

    /// Snapshot of every field's shared state, taken without holding map refs
    /// across awaits.
    pub(super) fn all_field_states(&self) -> Vec<SharedFieldState> {
        self.fields.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) fn field_of_reservation(&self, reservation_id: Id) -> Option<Id> {
        self.index
            .reservation_field
            .get(&reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append then apply, with the field lock already held.
    pub(super) async fn persist_and_apply(
        &self,
        fs: &mut FieldState,
        event: &Event,
    ) -> StoreResult<()> {
        self.wal_append(event).await?;
        apply_to_field(fs, event, &self.index);
        Ok(())
    }

    /// Acquire a live field's write lock.
    pub(super) async fn lock_field(
        &self,
        field_id: Id,
    ) -> StoreResult<OwnedRwLockWriteGuard<FieldState>> {
        let fs = self
            .field_state(field_id)
            .ok_or_else(|| StoreError::not_found("field", field_id))?;
        let guard = fs.write_owned().await;
        if guard.deleted {
            return Err(StoreError::not_found("field", field_id));
        }
        Ok(guard)
    }

    /// Lookup reservation → field, acquire that field's write lock.
    pub(super) async fn lock_reservation(
        &self,
        reservation_id: Id,
    ) -> StoreResult<OwnedRwLockWriteGuard<FieldState>> {
        let field_id = self
            .field_of_reservation(reservation_id)
            .ok_or_else(|| StoreError::not_found("reservation", reservation_id))?;
        let guard = self.lock_field(field_id).await.map_err(|e| match e {
            StoreError::NotFound { .. } => StoreError::not_found("reservation", reservation_id),
            other => other,
        })?;
        if guard.reservation(reservation_id).is_none() {
            return Err(StoreError::not_found("reservation", reservation_id));
        }
        Ok(guard)
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

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> StoreResult<()> {
        let _gate = self.gate.write().await;

        let mut states = Vec::new();
        for fs in self.all_field_states() {
            let guard = fs.read_owned().await;
            if !guard.deleted {
                states.push(guard);
            }
        }
        states.sort_by_key(|fs| fs.field.id);

        let mut events = vec![self.seq.floor()];
        for fs in &states {
            events.push(Event::FieldCreated {
                field: fs.field.clone(),
            });
            if !fs.schedules.is_empty() {
                events.push(Event::SchedulesReplaced {
                    field_id: fs.field.id,
                    schedules: fs.schedules.clone(),
                });
            }
            for reservation in &fs.reservations {
                events.push(Event::ReservationInserted {
                    reservation: reservation.clone(),
                });
                let payment = self
                    .index
                    .payment_by_reservation
                    .get(&reservation.id)
                    .and_then(|pid| {
                        self.index
                            .payments
                            .get(pid.value())
                            .map(|p| p.value().clone())
                    });
                if let Some(payment) = payment {
                    events.push(Event::PaymentInserted { payment });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }
}
