use async_trait::async_trait;

use crate::model::*;
use crate::store::*;

use super::Engine;

#[async_trait]
impl FieldStore for Engine {
    async fn insert_field(&self, field: NewField) -> StoreResult<Field> {
        self.create_field(field).await
    }

    async fn get_field(&self, id: Id) -> StoreResult<Field> {
        Engine::get_field(self, id).await
    }

    async fn list_fields(&self) -> StoreResult<Vec<Field>> {
        Ok(Engine::list_fields(self).await)
    }

    async fn list_fields_by_owner(&self, owner_id: Id) -> StoreResult<Vec<Field>> {
        Ok(Engine::list_fields_by_owner(self, owner_id).await)
    }

    async fn update_field(&self, field: Field) -> StoreResult<Field> {
        Engine::update_field(self, field).await
    }

    async fn delete_field(&self, id: Id) -> StoreResult<()> {
        Engine::delete_field(self, id).await
    }
}

#[async_trait]
impl ScheduleStore for Engine {
    async fn list_schedules(&self, field_id: Id) -> StoreResult<Vec<WeeklySchedule>> {
        Engine::list_schedules(self, field_id).await
    }

    async fn replace_schedules(
        &self,
        field_id: Id,
        entries: Vec<NewSchedule>,
    ) -> StoreResult<Vec<WeeklySchedule>> {
        Engine::replace_schedules(self, field_id, entries).await
    }
}

#[async_trait]
impl ReservationStore for Engine {
    async fn book(
        &self,
        reservation: NewReservation,
        gateway: &str,
    ) -> StoreResult<(Reservation, Payment)> {
        Engine::book(self, reservation, gateway).await
    }

    async fn insert_reservation(&self, reservation: NewReservation) -> StoreResult<Reservation> {
        Engine::insert_reservation(self, reservation).await
    }

    async fn get_reservation(&self, id: Id) -> StoreResult<Reservation> {
        Engine::get_reservation(self, id).await
    }

    async fn list_reservations_for_user(&self, user_id: Id) -> StoreResult<Vec<Reservation>> {
        Ok(Engine::list_reservations_for_user(self, user_id).await)
    }

    async fn list_reservations_for_field(&self, field_id: Id) -> StoreResult<Vec<Reservation>> {
        Ok(Engine::list_reservations_for_field(self, field_id).await)
    }

    async fn update_reservation(&self, reservation: Reservation) -> StoreResult<Reservation> {
        Engine::update_reservation(self, reservation).await
    }

    async fn transition_reservation(
        &self,
        id: Id,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> StoreResult<Reservation> {
        Engine::transition_reservation(self, id, from, to).await
    }

    async fn delete_reservation(&self, id: Id) -> StoreResult<()> {
        Engine::delete_reservation(self, id).await
    }

    async fn is_available(&self, field_id: Id, span: Span) -> StoreResult<bool> {
        Ok(Engine::is_available(self, field_id, &span).await)
    }

    async fn find_conflicts(&self, field_id: Id, span: Span) -> StoreResult<Vec<Reservation>> {
        Ok(Engine::find_conflicts(self, field_id, &span).await)
    }
}

#[async_trait]
impl PaymentStore for Engine {
    async fn insert_payment(&self, payment: NewPayment) -> StoreResult<Payment> {
        Engine::insert_payment(self, payment).await
    }

    async fn get_payment(&self, id: Id) -> StoreResult<Payment> {
        Engine::get_payment(self, id)
    }

    async fn payment_for_reservation(&self, reservation_id: Id) -> StoreResult<Payment> {
        Engine::payment_for_reservation(self, reservation_id)
    }

    async fn payment_for_transaction(&self, transaction_id: &str) -> StoreResult<Payment> {
        Engine::payment_for_transaction(self, transaction_id)
    }

    async fn update_payment(&self, payment: Payment) -> StoreResult<Payment> {
        Engine::update_payment(self, payment).await
    }

    async fn delete_payment(&self, id: Id) -> StoreResult<()> {
        Engine::delete_payment(self, id).await
    }

    async fn settle_payment(
        &self,
        transaction_id: &str,
        outcome: PaymentOutcome,
        at: Ts,
    ) -> StoreResult<Settlement> {
        Engine::settle_payment(self, transaction_id, outcome, at).await
    }
}
