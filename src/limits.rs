// Fixed business rules and input bounds.

/// Cancellation is allowed only while the booking starts strictly more than
/// this many hours from now.
pub const CANCELLATION_CUTOFF_HOURS: i64 = 2;

pub const SLOT_LENGTH_MINUTES: i64 = 60;

/// Longest single booking accepted by `BookingService::create`.
pub const MAX_BOOKING_HOURS: i64 = 24;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ADDRESS_LEN: usize = 512;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_IMAGE_URL_LEN: usize = 2048;

pub const DEFAULT_PAYMENT_GATEWAY: &str = "MIDTRANS";
