use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single appointment may not span more than a day.
pub const MAX_APPOINTMENT_DURATION_MS: Ms = 24 * 3_600_000;
/// Publish periods and query windows are capped at a year.
pub const MAX_WINDOW_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_SLOTS_PER_PUBLISH: usize = 10_000;
pub const MAX_SLOT_CAPACITY: u32 = 1_000;
pub const MAX_REASON_LEN: usize = 2_048;
pub const MAX_ID_LEN: usize = 256;
