use std::cmp::Reverse;

use crate::model::*;
use crate::store::{StoreError, StoreResult};

use super::Engine;
use super::conflict::conflicts;

impl Engine {
    pub async fn get_field(&self, id: Id) -> StoreResult<Field> {
        let fs = self
            .field_state(id)
            .ok_or_else(|| StoreError::not_found("field", id))?;
        let guard = fs.read().await;
        if guard.deleted {
            return Err(StoreError::not_found("field", id));
        }
        Ok(guard.field.clone())
    }

    pub async fn list_fields(&self) -> Vec<Field> {
        self.collect_fields(|_| true).await
    }

    pub async fn list_fields_by_owner(&self, owner_id: Id) -> Vec<Field> {
        self.collect_fields(|f| f.is_owned_by(owner_id)).await
    }

    async fn collect_fields(&self, keep: impl Fn(&Field) -> bool) -> Vec<Field> {
        let mut out = Vec::new();
        for fs in self.all_field_states() {
            let guard = fs.read().await;
            if !guard.deleted && keep(&guard.field) {
                out.push(guard.field.clone());
            }
        }
        out.sort_by_key(|f| f.id);
        out
    }

    pub async fn list_schedules(&self, field_id: Id) -> StoreResult<Vec<WeeklySchedule>> {
        let fs = self
            .field_state(field_id)
            .ok_or_else(|| StoreError::not_found("field", field_id))?;
        let guard = fs.read().await;
        if guard.deleted {
            return Err(StoreError::not_found("field", field_id));
        }
        Ok(guard.schedules.clone())
    }

    pub async fn get_reservation(&self, id: Id) -> StoreResult<Reservation> {
        let not_found = || StoreError::not_found("reservation", id);
        let field_id = self.field_of_reservation(id).ok_or_else(not_found)?;
        let fs = self.field_state(field_id).ok_or_else(not_found)?;
        let guard = fs.read().await;
        guard.reservation(id).cloned().ok_or_else(not_found)
    }

    /// Newest first.
    pub async fn list_reservations_for_user(&self, user_id: Id) -> Vec<Reservation> {
        let mut out = Vec::new();
        for fs in self.all_field_states() {
            let guard = fs.read().await;
            if guard.deleted {
                continue;
            }
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.user_id == user_id)
                    .cloned(),
            );
        }
        out.sort_by_key(|r| Reverse((r.created_at, r.id)));
        out
    }

    /// Ascending by start. Unknown fields have no reservations.
    pub async fn list_reservations_for_field(&self, field_id: Id) -> Vec<Reservation> {
        let Some(fs) = self.field_state(field_id) else {
            return Vec::new();
        };
        let guard = fs.read().await;
        if guard.deleted {
            return Vec::new();
        }
        guard.reservations.clone()
    }

    pub async fn is_available(&self, field_id: Id, span: &Span) -> bool {
        let Some(fs) = self.field_state(field_id) else {
            return true;
        };
        let guard = fs.read().await;
        conflicts(&guard, span).next().is_none()
    }

    pub async fn find_conflicts(&self, field_id: Id, span: &Span) -> Vec<Reservation> {
        let Some(fs) = self.field_state(field_id) else {
            return Vec::new();
        };
        let guard = fs.read().await;
        conflicts(&guard, span).cloned().collect()
    }

    pub fn get_payment(&self, id: Id) -> StoreResult<Payment> {
        self.index
            .payments
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| StoreError::not_found("payment", id))
    }

    pub fn payment_for_reservation(&self, reservation_id: Id) -> StoreResult<Payment> {
        let payment_id = self
            .index
            .payment_by_reservation
            .get(&reservation_id)
            .map(|e| *e.value())
            .ok_or_else(|| StoreError::not_found("payment for reservation", reservation_id))?;
        self.get_payment(payment_id)
    }

    pub fn payment_for_transaction(&self, transaction_id: &str) -> StoreResult<Payment> {
        let payment_id = self
            .index
            .payment_by_transaction
            .get(transaction_id)
            .map(|e| *e.value())
            .ok_or_else(|| StoreError::not_found("payment for transaction", transaction_id))?;
        self.get_payment(payment_id)
    }
}
