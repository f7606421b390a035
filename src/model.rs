use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{MAX_COURIER_DELIVERIES, MAX_TIMESLOT_DELIVERIES};

/// Couriers are identified by the numeric id used in schedule files.
pub type CourierId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CourierStatus {
    Available,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeslotStatus {
    Available,
    NotAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Scheduled,
    Completed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Scheduled => "scheduled",
            DeliveryStatus::Completed => "completed",
        }
    }
}

impl TimeslotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeslotStatus::Available => "available",
            TimeslotStatus::NotAvailable => "not_available",
        }
    }
}

/// A geocoded postal address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub house_number: String,
    pub city: String,
    pub country: String,
    pub country_code: String,
}

/// Remaining delivery quota of one courier on one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierCapacity {
    pub courier_id: CourierId,
    pub date: NaiveDate,
    /// Country whose holidays apply to this courier, when the schedule names one.
    pub country_code: Option<String>,
    pub remaining: u8,
    pub status: CourierStatus,
}

impl CourierCapacity {
    pub fn new(courier_id: CourierId, date: NaiveDate, country_code: Option<String>) -> Self {
        Self {
            courier_id,
            date,
            country_code,
            remaining: MAX_COURIER_DELIVERIES,
            status: CourierStatus::Available,
        }
    }
}

/// A bookable window offered by one courier on one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeslot {
    pub id: Ulid,
    pub courier_id: CourierId,
    pub date: NaiveDate,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub scheduled: u8,
    pub status: TimeslotStatus,
    /// Set once the date was found to be a holiday. Never cleared.
    pub holiday: bool,
    pub supported_addresses: BTreeSet<String>,
}

impl Timeslot {
    pub fn new(
        id: Ulid,
        courier_id: CourierId,
        start: NaiveDateTime,
        end: NaiveDateTime,
        supported_addresses: BTreeSet<String>,
    ) -> Self {
        Self {
            id,
            courier_id,
            date: start.date(),
            start,
            end,
            scheduled: 0,
            status: TimeslotStatus::Available,
            holiday: false,
            supported_addresses,
        }
    }

    pub fn is_full(&self) -> bool {
        self.scheduled >= MAX_TIMESLOT_DELIVERIES
    }

    pub fn serves(&self, city: &str) -> bool {
        self.supported_addresses.contains(city)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: Ulid,
    pub timeslot_id: Ulid,
    pub courier_id: CourierId,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    /// Free-text address as entered by the user.
    pub address: String,
    pub country_code: String,
    /// Cached geocoding result for `address`.
    pub resolved: Option<Address>,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScheduleCleared,
    CourierDayAdded {
        courier_id: CourierId,
        date: NaiveDate,
        country_code: Option<String>,
    },
    TimeslotAdded {
        id: Ulid,
        courier_id: CourierId,
        start: NaiveDateTime,
        end: NaiveDateTime,
        supported_addresses: Vec<String>,
    },
    TimeslotHolidayMarked {
        id: Ulid,
    },
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        address: String,
        country_code: String,
    },
    AddressResolved {
        user_id: Ulid,
        address: Address,
    },
    DeliveryBooked {
        id: Ulid,
        timeslot_id: Ulid,
        courier_id: CourierId,
        user_id: Ulid,
        date: NaiveDate,
    },
    DeliveryCancelled {
        id: Ulid,
        timeslot_id: Ulid,
        courier_id: CourierId,
        date: NaiveDate,
    },
    DeliveryCompleted {
        id: Ulid,
        timeslot_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One bookable timeslot as offered to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeslotSummary {
    pub timeslot_id: Ulid,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Non-fatal problems met while computing availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityWarning {
    /// Holiday data for the country could not be fetched; no holidays were applied.
    HolidayLookupFailed { country_code: String, reason: String },
    /// The user's address could not be resolved; no timeslot could be matched.
    AddressUnresolved { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvailabilityReport {
    pub slots: Vec<TimeslotSummary>,
    pub warnings: Vec<AvailabilityWarning>,
    /// Timeslots newly excluded because their date is a holiday.
    pub holidays_marked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 7, 19)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn new_courier_has_full_quota() {
        let date = NaiveDate::from_ymd_opt(2021, 7, 19).unwrap();
        let c = CourierCapacity::new(7, date, None);
        assert_eq!(c.remaining, MAX_COURIER_DELIVERIES);
        assert_eq!(c.status, CourierStatus::Available);
    }

    #[test]
    fn timeslot_date_follows_start() {
        let ts = Timeslot::new(Ulid::new(), 1, at(9, 0), at(11, 0), BTreeSet::new());
        assert_eq!(ts.date, NaiveDate::from_ymd_opt(2021, 7, 19).unwrap());
        assert_eq!(ts.status, TimeslotStatus::Available);
        assert!(!ts.holiday);
        assert!(!ts.is_full());
    }

    #[test]
    fn serves_matches_exact_city() {
        let cities: BTreeSet<String> = ["Tel Aviv".to_string(), "Haifa".to_string()].into();
        let ts = Timeslot::new(Ulid::new(), 1, at(9, 0), at(11, 0), cities);
        assert!(ts.serves("Haifa"));
        assert!(!ts.serves("haifa"));
        assert!(!ts.serves("Eilat"));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::DeliveryBooked {
            id: Ulid::new(),
            timeslot_id: Ulid::new(),
            courier_id: 3,
            user_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2021, 7, 20).unwrap(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
