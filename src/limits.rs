//! Capacity constants and input caps.

/// Deliveries a single timeslot can hold.
pub const MAX_TIMESLOT_DELIVERIES: u8 = 2;

/// Deliveries a courier can fulfil on one date.
pub const MAX_COURIER_DELIVERIES: u8 = 10;

/// Days covered by an availability query and by weekly reporting.
pub const WEEK_DAYS: u32 = 7;

/// Widest reporting window accepted by `deliveries_between`.
pub const MAX_REPORT_DAYS: u32 = 366;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 100;
pub const MAX_ADDRESS_LEN: usize = 500;
pub const MAX_COUNTRY_CODE_LEN: usize = 8;
pub const MAX_SUPPORTED_ADDRESSES: usize = 256;
pub const MAX_TIMESLOTS_PER_LOAD: usize = 100_000;
