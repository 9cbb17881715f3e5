/// Step between candidate slots when suggesting an alternate time.
pub const SLOT_STEP_MINUTES: i64 = 30;

/// Active appointments one owner may hold on a single calendar day.
pub const MAX_ACTIVE_PER_OWNER_PER_DAY: usize = 2;

/// Phone numbers are exactly this many ASCII digits.
pub const PHONE_DIGITS: usize = 10;

/// Byte cap on every free-text field of an appointment.
pub const MAX_FIELD_LEN: usize = 256;

/// Hard cap on rows kept in the store (all statuses).
pub const MAX_APPOINTMENTS: usize = 1_000_000;

/// Largest WAL frame payload accepted on replay, in bytes.
pub const MAX_WAL_FRAME_LEN: usize = 64 * 1024;
