/// Max availability windows a single coach may publish.
pub const MAX_WINDOWS_PER_COACH: usize = 1_000;

/// Max distinct coaches with stored state.
pub const MAX_COACHES: usize = 100_000;

/// Max upcoming bookings one listing may return; more is an error.
pub const MAX_BOOKINGS_LISTED: usize = 10_000;

/// Max raw length of a day or time-of-day literal accepted from the wire.
pub const MAX_FIELD_LEN: usize = 64;

/// Max length of a single SQL statement.
pub const MAX_SQL_LEN: usize = 16 * 1024;
