//! Storage contracts consumed by the services.
//!
//! Each trait covers one entity. Ids are assigned by the store. Reads return
//! snapshots: callers may hold the returned values without blocking writers.

use async_trait::async_trait;
use chrono::NaiveTime;
use thiserror::Error;

use crate::model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    /// An admitted reservation would overlap the given blocking reservation.
    #[error("conflict with reservation: {0}")]
    Conflict(Id),
    #[error("field {0} has active reservations")]
    Referenced(Id),
    #[error("{0} cannot be changed after creation")]
    Immutable(&'static str),
    #[error("duplicate {0}")]
    Duplicate(String),
    /// Compare-and-set lost: the reservation is no longer in the expected status.
    #[error("reservation is {current}")]
    StatusChanged { current: ReservationStatus },
    /// Compare-and-set lost: the payment was already settled.
    #[error("payment is {current}")]
    PaymentStatusChanged { current: PaymentStatus },
    #[error("WAL error: {0}")]
    Wal(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewField {
    pub owner_id: Id,
    pub name: String,
    pub address: String,
    pub description: String,
    pub image_url: String,
    pub price_per_hour: i64,
    pub created_at: Ts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewSchedule {
    pub day: DayOfWeek,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub user_id: Id,
    pub field_id: Id,
    pub span: Span,
    pub total_price: i64,
    pub status: ReservationStatus,
    pub created_at: Ts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub reservation_id: Id,
    pub amount: i64,
    pub gateway: String,
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub created_at: Ts,
}

/// What the payment gateway reported for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Success,
    Failed,
}

/// A settled payment and its reservation as stored after settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub reservation: Reservation,
    pub payment: Payment,
    /// The status the reservation moved to, if settlement moved it.
    pub moved_to: Option<ReservationStatus>,
}

#[async_trait]
pub trait FieldStore: Send + Sync {
    async fn insert_field(&self, field: NewField) -> StoreResult<Field>;
    async fn get_field(&self, id: Id) -> StoreResult<Field>;
    /// All fields, ascending by id.
    async fn list_fields(&self) -> StoreResult<Vec<Field>>;
    async fn list_fields_by_owner(&self, owner_id: Id) -> StoreResult<Vec<Field>>;
    /// Replace every mutable attribute. `id`, `owner_id` and `created_at` are kept.
    async fn update_field(&self, field: Field) -> StoreResult<Field>;
    /// Refused with `Referenced` while pending or confirmed reservations exist.
    async fn delete_field(&self, id: Id) -> StoreResult<()>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// A field's schedules ordered by day.
    async fn list_schedules(&self, field_id: Id) -> StoreResult<Vec<WeeklySchedule>>;
    /// Atomically swap the whole weekly schedule of a field.
    async fn replace_schedules(
        &self,
        field_id: Id,
        entries: Vec<NewSchedule>,
    ) -> StoreResult<Vec<WeeklySchedule>>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Admit a reservation together with its pending payment, or fail with
    /// `Conflict` if a blocking reservation overlaps. The check and both
    /// inserts happen as one step.
    async fn book(
        &self,
        reservation: NewReservation,
        gateway: &str,
    ) -> StoreResult<(Reservation, Payment)>;
    /// Raw insert. Still refuses blocking overlaps.
    async fn insert_reservation(&self, reservation: NewReservation) -> StoreResult<Reservation>;
    async fn get_reservation(&self, id: Id) -> StoreResult<Reservation>;
    /// Newest first.
    async fn list_reservations_for_user(&self, user_id: Id) -> StoreResult<Vec<Reservation>>;
    /// Ascending by start.
    async fn list_reservations_for_field(&self, field_id: Id) -> StoreResult<Vec<Reservation>>;
    /// Only `status` and `payment_id` may differ from the stored record.
    async fn update_reservation(&self, reservation: Reservation) -> StoreResult<Reservation>;
    /// Move `id` from `from` to `to`, failing with `StatusChanged` if another
    /// writer moved it first.
    async fn transition_reservation(
        &self,
        id: Id,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> StoreResult<Reservation>;
    async fn delete_reservation(&self, id: Id) -> StoreResult<()>;
    /// True iff no blocking reservation of `field_id` overlaps `span`.
    async fn is_available(&self, field_id: Id, span: Span) -> StoreResult<bool>;
    /// Blocking reservations of `field_id` overlapping `span`, in start order.
    async fn find_conflicts(&self, field_id: Id, span: Span) -> StoreResult<Vec<Reservation>>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert_payment(&self, payment: NewPayment) -> StoreResult<Payment>;
    async fn get_payment(&self, id: Id) -> StoreResult<Payment>;
    async fn payment_for_reservation(&self, reservation_id: Id) -> StoreResult<Payment>;
    async fn payment_for_transaction(&self, transaction_id: &str) -> StoreResult<Payment>;
    async fn update_payment(&self, payment: Payment) -> StoreResult<Payment>;
    async fn delete_payment(&self, id: Id) -> StoreResult<()>;
    /// Settle the pending payment of `transaction_id` and move its reservation
    /// in one step. Fails with `PaymentStatusChanged` if it is already
    /// settled. Success needs a pending reservation and confirms it, else
    /// `StatusChanged`. Failure releases a pending reservation and leaves
    /// any other status alone.
    async fn settle_payment(
        &self,
        transaction_id: &str,
        outcome: PaymentOutcome,
        at: Ts,
    ) -> StoreResult<Settlement>;
}
