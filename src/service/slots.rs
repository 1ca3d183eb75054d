use chrono::{NaiveDate, TimeDelta};

use crate::limits::SLOT_LENGTH_MINUTES;
use crate::model::{Span, WeeklySchedule};

pub fn slot_length() -> TimeDelta {
    TimeDelta::minutes(SLOT_LENGTH_MINUTES)
}

/// Fixed-length windows covering `schedule`'s open hours on `date`, in
/// start order. A slot is emitted while its start is before closing time,
/// so the last one may run past close when the window is not a whole
/// number of slots. `None` if a slot would end past the last representable
/// timestamp.
pub fn candidate_slots(
    schedule: &WeeklySchedule,
    date: NaiveDate,
    length: TimeDelta,
) -> Option<Vec<Span>> {
    debug_assert!(length > TimeDelta::zero(), "slot length must be positive");
    let day_end = schedule.closes_on(date);
    let mut current = schedule.opens_on(date);
    let mut slots = Vec::new();
    while current < day_end {
        let end = current.checked_add_signed(length)?;
        slots.push(Span::new(current, end));
        current = end;
    }
    Some(slots)
}
