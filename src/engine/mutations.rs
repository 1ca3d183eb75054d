use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::*;
use crate::store::{
    NewField, NewPayment, NewReservation, NewSchedule, PaymentOutcome, Settlement, StoreError,
    StoreResult,
};

use super::conflict::check_no_conflict;
use super::{Engine, Sequences, apply_payment};

impl Engine {
    pub async fn create_field(&self, new: NewField) -> StoreResult<Field> {
        let _gate = self.gate.read().await;
        let field = Field {
            id: Sequences::next(&self.seq.fields),
            owner_id: new.owner_id,
            name: new.name,
            address: new.address,
            description: new.description,
            image_url: new.image_url,
            price_per_hour: new.price_per_hour,
            created_at: new.created_at,
        };
        let event = Event::FieldCreated {
            field: field.clone(),
        };
        self.wal_append(&event).await?;
        self.fields
            .insert(field.id, Arc::new(RwLock::new(FieldState::new(field.clone()))));
        Ok(field)
    }

    pub async fn update_field(&self, field: Field) -> StoreResult<Field> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_field(field.id).await?;
        let updated = Field {
            id: guard.field.id,
            owner_id: guard.field.owner_id,
            created_at: guard.field.created_at,
            ..field
        };
        let event = Event::FieldUpdated {
            field: updated.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(updated)
    }

    pub async fn delete_field(&self, id: Id) -> StoreResult<()> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_field(id).await?;
        if guard.has_active_reservations() {
            return Err(StoreError::Referenced(id));
        }
        let event = Event::FieldDeleted { id };
        self.wal_append(&event).await?;
        guard.deleted = true;
        for r in &guard.reservations {
            self.index.forget_reservation(r.id);
        }
        self.fields.remove(&id);
        Ok(())
    }

    pub async fn replace_schedules(
        &self,
        field_id: Id,
        entries: Vec<NewSchedule>,
    ) -> StoreResult<Vec<WeeklySchedule>> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_field(field_id).await?;

        let mut schedules: Vec<WeeklySchedule> = entries
            .into_iter()
            .map(|e| WeeklySchedule {
                id: 0,
                field_id,
                day: e.day,
                open: e.open,
                close: e.close,
            })
            .collect();
        schedules.sort_by_key(|s| s.day);
        if let Some(pair) = schedules.windows(2).find(|w| w[0].day == w[1].day) {
            return Err(StoreError::Duplicate(format!("schedule for {}", pair[0].day)));
        }
        for s in &mut schedules {
            s.id = Sequences::next(&self.seq.schedules);
        }

        let event = Event::SchedulesReplaced {
            field_id,
            schedules: schedules.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(schedules)
    }

    /// Check, allocate and persist a reservation with its payment under one
    /// write lock and one WAL record.
    pub async fn book(
        &self,
        new: NewReservation,
        gateway: &str,
    ) -> StoreResult<(Reservation, Payment)> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_field(new.field_id).await?;

        check_no_conflict(&guard, &new.span, None)?;

        let reservation_id = Sequences::next(&self.seq.reservations);
        let payment_id = Sequences::next(&self.seq.payments);
        let payment = Payment {
            id: payment_id,
            reservation_id,
            amount: new.total_price,
            gateway: gateway.to_string(),
            transaction_id: Payment::transaction_id_for(gateway, reservation_id, new.created_at),
            status: PaymentStatus::Pending,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        let reservation = Reservation {
            id: reservation_id,
            user_id: new.user_id,
            field_id: new.field_id,
            span: new.span,
            total_price: new.total_price,
            status: new.status,
            payment_id: Some(payment_id),
            created_at: new.created_at,
        };

        let event = Event::ReservationBooked {
            reservation: reservation.clone(),
            payment: payment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok((reservation, payment))
    }

    pub async fn insert_reservation(&self, new: NewReservation) -> StoreResult<Reservation> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_field(new.field_id).await?;

        if new.status.is_blocking() {
            check_no_conflict(&guard, &new.span, None)?;
        }

        let reservation = Reservation {
            id: Sequences::next(&self.seq.reservations),
            user_id: new.user_id,
            field_id: new.field_id,
            span: new.span,
            total_price: new.total_price,
            status: new.status,
            payment_id: None,
            created_at: new.created_at,
        };
        let event = Event::ReservationInserted {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(reservation)
    }

    pub async fn update_reservation(&self, reservation: Reservation) -> StoreResult<Reservation> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_reservation(reservation.id).await?;
        let current = guard
            .reservation(reservation.id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("reservation", reservation.id))?;

        if reservation.field_id != current.field_id {
            return Err(StoreError::Immutable("reservation field"));
        }
        if reservation.span != current.span {
            return Err(StoreError::Immutable("reservation window"));
        }
        if reservation.total_price != current.total_price {
            return Err(StoreError::Immutable("reservation price"));
        }
        if reservation.user_id != current.user_id || reservation.created_at != current.created_at {
            return Err(StoreError::Immutable("reservation owner"));
        }
        if reservation.status.is_blocking() && !current.status.is_blocking() {
            check_no_conflict(&guard, &reservation.span, Some(reservation.id))?;
        }

        let event = Event::ReservationUpdated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(reservation)
    }

    pub async fn transition_reservation(
        &self,
        id: Id,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> StoreResult<Reservation> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_reservation(id).await?;
        let mut reservation = guard
            .reservation(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("reservation", id))?;

        if reservation.status != from {
            return Err(StoreError::StatusChanged {
                current: reservation.status,
            });
        }
        if to.is_blocking() && !from.is_blocking() {
            check_no_conflict(&guard, &reservation.span, Some(id))?;
        }

        reservation.status = to;
        let event = Event::ReservationUpdated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(reservation)
    }

    /// Removes the reservation and its payment.
    pub async fn delete_reservation(&self, id: Id) -> StoreResult<()> {
        let _gate = self.gate.read().await;
        let mut guard = self.lock_reservation(id).await?;
        let event = Event::ReservationDeleted {
            id,
            field_id: guard.field.id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn insert_payment(&self, new: NewPayment) -> StoreResult<Payment> {
        let _gate = self.gate.read().await;
        let _guard = self.lock_reservation(new.reservation_id).await?;

        if self
            .index
            .payment_by_reservation
            .contains_key(&new.reservation_id)
        {
            return Err(StoreError::Duplicate(format!(
                "payment for reservation {}",
                new.reservation_id
            )));
        }
        if self
            .index
            .payment_by_transaction
            .contains_key(&new.transaction_id)
        {
            return Err(StoreError::Duplicate(format!(
                "transaction {}",
                new.transaction_id
            )));
        }

        let payment = Payment {
            id: Sequences::next(&self.seq.payments),
            reservation_id: new.reservation_id,
            amount: new.amount,
            gateway: new.gateway,
            transaction_id: new.transaction_id,
            status: new.status,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        let event = Event::PaymentInserted {
            payment: payment.clone(),
        };
        self.wal_append(&event).await?;
        apply_payment(&event, &self.index);
        Ok(payment)
    }

    /// Only `status`, `transaction_id` and `updated_at` may change.
    pub async fn update_payment(&self, payment: Payment) -> StoreResult<Payment> {
        let _gate = self.gate.read().await;
        let current = self.payment_snapshot(payment.id)?;
        let _guard = self.lock_reservation(current.reservation_id).await?;
        // Re-read under the lock in case it was deleted meanwhile.
        let current = self.payment_snapshot(payment.id)?;

        if payment.reservation_id != current.reservation_id {
            return Err(StoreError::Immutable("payment reservation"));
        }
        if payment.amount != current.amount || payment.gateway != current.gateway {
            return Err(StoreError::Immutable("payment amount"));
        }
        if payment.transaction_id != current.transaction_id
            && self
                .index
                .payment_by_transaction
                .contains_key(&payment.transaction_id)
        {
            return Err(StoreError::Duplicate(format!(
                "transaction {}",
                payment.transaction_id
            )));
        }
        let payment = Payment {
            created_at: current.created_at,
            ..payment
        };

        let event = Event::PaymentUpdated {
            payment: payment.clone(),
        };
        self.wal_append(&event).await?;
        apply_payment(&event, &self.index);
        Ok(payment)
    }

    pub async fn delete_payment(&self, id: Id) -> StoreResult<()> {
        let _gate = self.gate.read().await;
        let current = self.payment_snapshot(id)?;
        let _guard = self.lock_reservation(current.reservation_id).await?;
        self.payment_snapshot(id)?;

        let event = Event::PaymentDeleted { id };
        self.wal_append(&event).await?;
        apply_payment(&event, &self.index);
        Ok(())
    }

    /// Payment and reservation change together, under the field lock, in
    /// one WAL record.
    pub async fn settle_payment(
        &self,
        transaction_id: &str,
        outcome: PaymentOutcome,
        at: Ts,
    ) -> StoreResult<Settlement> {
        let _gate = self.gate.read().await;
        let reservation_id = self.payment_for_transaction(transaction_id)?.reservation_id;
        let mut guard = self.lock_reservation(reservation_id).await?;
        // Re-read under the lock: a concurrent settlement may have won.
        let mut payment = self.payment_for_transaction(transaction_id)?;
        if !payment.is_pending() {
            return Err(StoreError::PaymentStatusChanged {
                current: payment.status,
            });
        }
        let mut reservation = guard
            .reservation(reservation_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("reservation", reservation_id))?;

        let moved_to = match (outcome, reservation.status) {
            (PaymentOutcome::Success, ReservationStatus::Pending) => {
                Some(ReservationStatus::Confirmed)
            }
            (PaymentOutcome::Success, current) => {
                return Err(StoreError::StatusChanged { current });
            }
            (PaymentOutcome::Failed, ReservationStatus::Pending) => {
                Some(ReservationStatus::Cancelled)
            }
            (PaymentOutcome::Failed, _) => None,
        };
        if let Some(to) = moved_to {
            reservation.status = to;
        }
        match outcome {
            PaymentOutcome::Success => payment.mark_success(at),
            PaymentOutcome::Failed => payment.mark_failed(at),
        }

        let event = Event::PaymentSettled {
            reservation: reservation.clone(),
            payment: payment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Settlement {
            reservation,
            payment,
            moved_to,
        })
    }

    fn payment_snapshot(&self, id: Id) -> StoreResult<Payment> {
        self.index
            .payments
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| StoreError::not_found("payment", id))
    }
}
