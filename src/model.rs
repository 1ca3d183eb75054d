use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

use crate::limits::CANCELLATION_CUTOFF_HOURS;

/// Wall-clock timestamp in the field's local time. No timezone is attached;
/// callers normalize before handing instants to the core.
pub type Ts = NaiveDateTime;

/// Store-assigned identifier. Always positive once persisted.
pub type Id = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ts,
    pub end: Ts,
}

impl Span {
    pub fn new(start: Ts, end: Ts) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Abutting spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ts) -> bool {
        self.start <= t && t < self.end
    }

    /// Length in hours, a partial hour counting as a whole one.
    pub fn whole_hours(&self) -> i64 {
        let secs = self.duration().num_seconds();
        let hours = secs / 3600;
        if secs % 3600 > 0 { hours + 1 } else { hours }
    }
}

/// Day of the week, numbered 0 = Sunday through 6 = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DayOfWeek {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Sunday,
        DayOfWeek::Monday,
        DayOfWeek::Tuesday,
        DayOfWeek::Wednesday,
        DayOfWeek::Thursday,
        DayOfWeek::Friday,
        DayOfWeek::Saturday,
    ];

    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn index(self) -> i64 {
        self as i64
    }

    pub fn of(date: NaiveDate) -> Self {
        Self::ALL[date.weekday().num_days_from_sunday() as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            DayOfWeek::Sunday => "Sunday",
            DayOfWeek::Monday => "Monday",
            DayOfWeek::Tuesday => "Tuesday",
            DayOfWeek::Wednesday => "Wednesday",
            DayOfWeek::Thursday => "Thursday",
            DayOfWeek::Friday => "Friday",
            DayOfWeek::Saturday => "Saturday",
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A bookable, priced field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub id: Id,
    pub owner_id: Id,
    pub name: String,
    pub address: String,
    pub description: String,
    pub image_url: String,
    pub price_per_hour: i64,
    pub created_at: Ts,
}

impl Field {
    /// Price of `hours` whole hours, or `None` on overflow.
    pub fn price_for(&self, hours: i64) -> Option<i64> {
        self.price_per_hour.checked_mul(hours)
    }

    pub fn is_owned_by(&self, user_id: Id) -> bool {
        self.owner_id == user_id
    }
}

/// Recurring open window of a field on one day of the week.
/// `close > open`; overnight windows are not representable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub id: Id,
    pub field_id: Id,
    pub day: DayOfWeek,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl WeeklySchedule {
    /// True iff `instant` falls on this schedule's day and its time of day
    /// lies within `[open, close]`, both bounds inclusive. Sub-second
    /// precision is ignored.
    pub fn is_open_at(&self, instant: Ts) -> bool {
        if DayOfWeek::of(instant.date()) != self.day {
            return false;
        }
        let secs = instant.time().num_seconds_from_midnight();
        let open = self.open.num_seconds_from_midnight();
        let close = self.close.num_seconds_from_midnight();
        open <= secs && secs <= close
    }

    pub fn opens_on(&self, date: NaiveDate) -> Ts {
        date.and_time(self.open)
    }

    pub fn closes_on(&self, date: NaiveDate) -> Ts {
        date.and_time(self.close)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    /// Pending and confirmed reservations hold their window; terminal ones free it.
    pub fn is_blocking(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            "completed" => Some(ReservationStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's claim on a field for a fixed window. The window, field and
/// price never change after creation; only `status` and `payment_id` do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Id,
    pub user_id: Id,
    pub field_id: Id,
    pub span: Span,
    pub total_price: i64,
    pub status: ReservationStatus,
    /// Back-reference to the companion payment, looked up through the payment store.
    pub payment_id: Option<Id>,
    pub created_at: Ts,
}

impl Reservation {
    pub fn blocks(&self) -> bool {
        self.status.is_blocking()
    }

    pub fn duration_hours(&self) -> i64 {
        self.span.whole_hours()
    }

    /// Pending or confirmed, and starting more than the cutoff after `now`.
    pub fn can_be_cancelled(&self, now: Ts) -> bool {
        self.status.is_blocking()
            && self.span.start - now > TimeDelta::hours(CANCELLATION_CUTOFF_HOURS)
    }

    /// Confirmed and currently being played.
    pub fn is_active(&self, now: Ts) -> bool {
        self.status == ReservationStatus::Confirmed && self.span.start < now && now < self.span.end
    }

    pub fn has_ended(&self, now: Ts) -> bool {
        now >= self.span.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "success" => Some(PaymentStatus::Success),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Id,
    pub reservation_id: Id,
    pub amount: i64,
    pub gateway: String,
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub created_at: Ts,
    pub updated_at: Ts,
}

impl Payment {
    /// Human-readable diagnostic token; not a secret.
    pub fn transaction_id_for(gateway: &str, reservation_id: Id, at: Ts) -> String {
        format!("{gateway}-{reservation_id}-{}", at.and_utc().timestamp())
    }

    pub fn is_pending(&self) -> bool {
        self.status == PaymentStatus::Pending
    }

    pub fn mark_success(&mut self, now: Ts) {
        self.status = PaymentStatus::Success;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, now: Ts) {
        self.status = PaymentStatus::Failed;
        self.updated_at = now;
    }
}

/// A candidate booking window produced for display, tagged with whether
/// it is currently free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub span: Span,
    pub available: bool,
}

/// Everything the store keeps for one field, guarded by a single lock.
#[derive(Debug, Clone)]
pub struct FieldState {
    pub field: Field,
    /// At most one entry per day, sorted by day.
    pub schedules: Vec<WeeklySchedule>,
    /// Reservations of every status, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Set under the write lock when the field is deleted, so writers that
    /// raced the deletion see a tombstone instead of a live record.
    pub deleted: bool,
}

impl FieldState {
    pub fn new(field: Field) -> Self {
        Self {
            field,
            schedules: Vec::new(),
            reservations: Vec::new(),
            deleted: false,
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Id) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    /// Swap in a new version of an existing reservation. Returns the old one.
    pub fn replace_reservation(&mut self, reservation: Reservation) -> Option<Reservation> {
        let old = self.remove_reservation(reservation.id)?;
        self.insert_reservation(reservation);
        Some(old)
    }

    pub fn reservation(&self, id: Id) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations of any status whose window overlaps `query`.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        let query_start = query.start;
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query_start)
    }

    pub fn schedule_for(&self, day: DayOfWeek) -> Option<&WeeklySchedule> {
        self.schedules.iter().find(|s| s.day == day)
    }

    pub fn has_active_reservations(&self) -> bool {
        self.reservations.iter().any(Reservation::blocks)
    }
}

/// The WAL record format. One record is one atomic state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FieldCreated {
        field: Field,
    },
    FieldUpdated {
        field: Field,
    },
    FieldDeleted {
        id: Id,
    },
    SchedulesReplaced {
        field_id: Id,
        schedules: Vec<WeeklySchedule>,
    },
    /// A reservation admitted together with its companion payment.
    ReservationBooked {
        reservation: Reservation,
        payment: Payment,
    },
    ReservationInserted {
        reservation: Reservation,
    },
    ReservationUpdated {
        reservation: Reservation,
    },
    ReservationDeleted {
        id: Id,
        field_id: Id,
    },
    PaymentInserted {
        payment: Payment,
    },
    PaymentUpdated {
        payment: Payment,
    },
    PaymentDeleted {
        id: Id,
    },
    /// Written first by compaction so ids of deleted records are never reissued.
    SequenceFloor {
        fields: Id,
        schedules: Id,
        reservations: Id,
        payments: Id,
    },
    /// A gateway outcome recorded on the payment and its reservation at once.
    PaymentSettled {
        reservation: Reservation,
        payment: Payment,
    },
}

impl Event {
    /// The field whose lock guards this event, if any.
    pub fn field_id(&self) -> Option<Id> {
        match self {
            Event::FieldUpdated { field } => Some(field.id),
            Event::SchedulesReplaced { field_id, .. }
            | Event::ReservationDeleted { field_id, .. } => Some(*field_id),
            Event::ReservationBooked { reservation, .. }
            | Event::PaymentSettled { reservation, .. }
            | Event::ReservationInserted { reservation }
            | Event::ReservationUpdated { reservation } => Some(reservation.field_id),
            Event::FieldCreated { .. }
            | Event::FieldDeleted { .. }
            | Event::PaymentInserted { .. }
            | Event::PaymentUpdated { .. }
            | Event::PaymentDeleted { .. }
            | Event::SequenceFloor { .. } => None,
        }
    }
}
