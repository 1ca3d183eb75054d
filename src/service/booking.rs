use std::sync::Arc;

use chrono::TimeDelta;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::limits::MAX_BOOKING_HOURS;
use crate::model::*;
use crate::observability;
use crate::store::{
    FieldStore, NewReservation, PaymentOutcome, PaymentStore, ReservationStore, Settlement,
    StoreError,
};

use super::error::{ServiceError, ServiceResult, store_err};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub user_id: Id,
    pub field_id: Id,
    pub start: Ts,
    pub duration_hours: i64,
}

pub struct BookingService {
    fields: Arc<dyn FieldStore>,
    reservations: Arc<dyn ReservationStore>,
    payments: Arc<dyn PaymentStore>,
    clock: Arc<dyn Clock>,
    gateway: String,
}

/// Like `store_err`, but a lost compare-and-set becomes a state-transition error.
fn transition_err(action: &'static str) -> impl Fn(StoreError) -> ServiceError {
    move |e| match e {
        StoreError::StatusChanged { current } => {
            ServiceError::transition("booking", current, action)
        }
        other => store_err("updating booking status")(other),
    }
}

fn record_transition(to: ReservationStatus) {
    metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
}

impl BookingService {
    pub fn new(
        fields: Arc<dyn FieldStore>,
        reservations: Arc<dyn ReservationStore>,
        payments: Arc<dyn PaymentStore>,
        clock: Arc<dyn Clock>,
        gateway: impl Into<String>,
    ) -> Self {
        Self {
            fields,
            reservations,
            payments,
            clock,
            gateway: gateway.into(),
        }
    }

    /// Admit a pending reservation with its pending payment. Availability is
    /// checked by the store under the same lock that inserts the records.
    pub async fn create(&self, req: BookingRequest) -> ServiceResult<Reservation> {
        if req.user_id <= 0 {
            return Err(ServiceError::invalid("user_id must be positive"));
        }
        if req.field_id <= 0 {
            return Err(ServiceError::invalid("field_id must be positive"));
        }
        if req.duration_hours <= 0 {
            return Err(ServiceError::invalid("duration_hours must be positive"));
        }
        if req.duration_hours > MAX_BOOKING_HOURS {
            return Err(ServiceError::invalid(format!(
                "duration_hours must be at most {MAX_BOOKING_HOURS}"
            )));
        }
        let now = self.clock.now();
        if req.start <= now {
            return Err(ServiceError::invalid("start time must be in the future"));
        }

        let field = self
            .fields
            .get_field(req.field_id)
            .await
            .map_err(store_err("loading field"))?;
        let end = req
            .start
            .checked_add_signed(TimeDelta::hours(req.duration_hours))
            .ok_or_else(|| ServiceError::invalid("end time out of range"))?;
        let total_price = field
            .price_for(req.duration_hours)
            .ok_or_else(|| ServiceError::invalid("total price out of range"))?;

        let booked = self
            .reservations
            .book(
                NewReservation {
                    user_id: req.user_id,
                    field_id: field.id,
                    span: Span::new(req.start, end),
                    total_price,
                    status: ReservationStatus::Pending,
                    created_at: now,
                },
                &self.gateway,
            )
            .await;
        let (reservation, payment) = match booked {
            Ok(pair) => pair,
            Err(StoreError::Conflict(conflicting)) => {
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                info!(field_id = field.id, conflicting, "booking rejected: slot taken");
                return Err(ServiceError::SlotUnavailable { conflicting });
            }
            Err(e) => return Err(store_err("creating booking")(e)),
        };

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            reservation_id = reservation.id,
            field_id = field.id,
            user_id = req.user_id,
            transaction_id = %payment.transaction_id,
            "booking created"
        );
        Ok(reservation)
    }

    pub async fn get(&self, id: Id) -> ServiceResult<Reservation> {
        if id <= 0 {
            return Err(ServiceError::invalid("booking id must be positive"));
        }
        self.reservations
            .get_reservation(id)
            .await
            .map_err(store_err("loading booking"))
    }

    pub async fn list_for_user(&self, user_id: Id) -> ServiceResult<Vec<Reservation>> {
        if user_id <= 0 {
            return Err(ServiceError::invalid("user_id must be positive"));
        }
        self.reservations
            .list_reservations_for_user(user_id)
            .await
            .map_err(store_err("listing bookings"))
    }

    pub async fn list_for_field(&self, field_id: Id) -> ServiceResult<Vec<Reservation>> {
        if field_id <= 0 {
            return Err(ServiceError::invalid("field_id must be positive"));
        }
        self.reservations
            .list_reservations_for_field(field_id)
            .await
            .map_err(store_err("listing bookings"))
    }

    /// Blocking reservations overlapping `span`, by start time.
    pub async fn find_conflicts(
        &self,
        field_id: Id,
        span: Span,
    ) -> ServiceResult<Vec<Reservation>> {
        if field_id <= 0 {
            return Err(ServiceError::invalid("field_id must be positive"));
        }
        self.reservations
            .find_conflicts(field_id, span)
            .await
            .map_err(store_err("finding conflicts"))
    }

    /// Pending → Confirmed.
    pub async fn confirm(&self, id: Id) -> ServiceResult<Reservation> {
        let current = self.get(id).await?;
        if current.status != ReservationStatus::Pending {
            return Err(ServiceError::transition("booking", current.status, "confirm"));
        }
        let confirmed = self
            .reservations
            .transition_reservation(id, ReservationStatus::Pending, ReservationStatus::Confirmed)
            .await
            .map_err(transition_err("confirm"))?;
        record_transition(ReservationStatus::Confirmed);
        info!(reservation_id = id, "booking confirmed");
        Ok(confirmed)
    }

    /// Pending/Confirmed → Cancelled, by the owning user, outside the cutoff.
    pub async fn cancel(&self, user_id: Id, id: Id) -> ServiceResult<Reservation> {
        if user_id <= 0 {
            return Err(ServiceError::invalid("user_id must be positive"));
        }
        let current = self.get(id).await?;
        if current.user_id != user_id {
            return Err(ServiceError::Unauthorized(
                "only the booking owner can cancel it".into(),
            ));
        }
        if !current.status.is_blocking() {
            return Err(ServiceError::transition("booking", current.status, "cancel"));
        }
        if !current.can_be_cancelled(self.clock.now()) {
            return Err(ServiceError::CancellationWindowClosed);
        }
        let cancelled = self
            .reservations
            .transition_reservation(id, current.status, ReservationStatus::Cancelled)
            .await
            .map_err(transition_err("cancel"))?;
        record_transition(ReservationStatus::Cancelled);
        info!(reservation_id = id, user_id, "booking cancelled");
        Ok(cancelled)
    }

    /// Confirmed → Completed, once the window has ended.
    pub async fn complete(&self, id: Id) -> ServiceResult<Reservation> {
        let current = self.get(id).await?;
        if current.status != ReservationStatus::Confirmed {
            return Err(ServiceError::transition("booking", current.status, "complete"));
        }
        if !current.has_ended(self.clock.now()) {
            return Err(ServiceError::transition(
                "booking",
                current.status,
                "complete before end time",
            ));
        }
        let completed = self
            .reservations
            .transition_reservation(id, ReservationStatus::Confirmed, ReservationStatus::Completed)
            .await
            .map_err(transition_err("complete"))?;
        record_transition(ReservationStatus::Completed);
        info!(reservation_id = id, "booking completed");
        Ok(completed)
    }

    pub async fn payment_for(&self, reservation_id: Id) -> ServiceResult<Payment> {
        if reservation_id <= 0 {
            return Err(ServiceError::invalid("booking id must be positive"));
        }
        self.payments
            .payment_for_reservation(reservation_id)
            .await
            .map_err(store_err("loading payment"))
    }

    pub async fn payment_by_transaction(&self, transaction_id: &str) -> ServiceResult<Payment> {
        if transaction_id.trim().is_empty() {
            return Err(ServiceError::invalid("transaction_id is required"));
        }
        self.payments
            .payment_for_transaction(transaction_id)
            .await
            .map_err(store_err("loading payment"))
    }

    /// Record a gateway outcome. The store settles the payment and moves its
    /// booking as one step.
    async fn settle(
        &self,
        transaction_id: &str,
        outcome: PaymentOutcome,
        action: &'static str,
    ) -> ServiceResult<Settlement> {
        if transaction_id.trim().is_empty() {
            return Err(ServiceError::invalid("transaction_id is required"));
        }
        let settled = self
            .payments
            .settle_payment(transaction_id, outcome, self.clock.now())
            .await
            .map_err(|e| match e {
                StoreError::PaymentStatusChanged { current } => {
                    ServiceError::transition("payment", current, action)
                }
                StoreError::StatusChanged { current } => {
                    ServiceError::transition("booking", current, action)
                }
                other => store_err("settling payment")(other),
            })?;
        if let Some(to) = settled.moved_to {
            record_transition(to);
        }
        Ok(settled)
    }

    /// Gateway reported success: settle the payment and confirm the booking.
    pub async fn payment_succeeded(&self, transaction_id: &str) -> ServiceResult<Payment> {
        let settled = self
            .settle(transaction_id, PaymentOutcome::Success, "mark success")
            .await?;
        info!(
            reservation_id = settled.reservation.id,
            transaction_id,
            "payment succeeded, booking confirmed"
        );
        Ok(settled.payment)
    }

    /// Gateway reported failure: mark the payment failed and release a
    /// still-pending booking. The user cancellation cutoff does not apply.
    pub async fn payment_failed(&self, transaction_id: &str) -> ServiceResult<Payment> {
        let settled = self
            .settle(transaction_id, PaymentOutcome::Failed, "mark failed")
            .await?;
        if settled.moved_to.is_none() {
            warn!(
                reservation_id = settled.reservation.id,
                status = %settled.reservation.status,
                "payment failed for a booking that is no longer pending"
            );
        }
        info!(
            reservation_id = settled.reservation.id,
            transaction_id,
            "payment failed"
        );
        Ok(settled.payment)
    }
}
