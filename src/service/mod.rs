//! Business operations over the store contracts.

mod booking;
mod error;
mod field;
pub mod slots;

pub use booking::{BookingRequest, BookingService};
pub use error::{ServiceError, ServiceResult};
pub use field::{FieldInput, FieldService, ScheduleInput};

use std::sync::Arc;

use crate::clock::Clock;
use crate::store::{FieldStore, PaymentStore, ReservationStore, ScheduleStore};

/// Both services wired to one backing store.
pub struct Services {
    pub fields: FieldService,
    pub bookings: BookingService,
}

impl Services {
    pub fn new<S>(store: Arc<S>, clock: Arc<dyn Clock>, gateway: impl Into<String>) -> Self
    where
        S: FieldStore + ScheduleStore + ReservationStore + PaymentStore + 'static,
    {
        let fields = FieldService::new(
            store.clone() as Arc<dyn FieldStore>,
            store.clone() as Arc<dyn ScheduleStore>,
            store.clone() as Arc<dyn ReservationStore>,
            clock.clone(),
        );
        let bookings = BookingService::new(
            store.clone() as Arc<dyn FieldStore>,
            store.clone() as Arc<dyn ReservationStore>,
            store as Arc<dyn PaymentStore>,
            clock,
            gateway,
        );
        Self { fields, bookings }
    }
}
