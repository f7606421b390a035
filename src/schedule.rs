//! Courier schedule files.
//!
//! One courier object or an array of them:
//!
//! ```json
//! {"courier_id": 1, "country_code": "IL",
//!  "timeslots": {"19/07/2021": [["09:00", "11:00", ["Tel Aviv", "Ramat Gan"]]]}}
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;

use crate::model::CourierId;

const DATE_FORMAT: &str = "%d/%m/%Y";
const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    Io(String),
    Format(String),
    InvalidDate { courier_id: CourierId, value: String },
    InvalidTime { courier_id: CourierId, value: String },
    EmptySlot { courier_id: CourierId, date: NaiveDate, start: String, end: String },
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::Io(msg) => write!(f, "cannot read schedule: {msg}"),
            ScheduleError::Format(msg) => write!(f, "malformed schedule: {msg}"),
            ScheduleError::InvalidDate { courier_id, value } => {
                write!(f, "courier {courier_id}: invalid date '{value}', expected dd/mm/YYYY")
            }
            ScheduleError::InvalidTime { courier_id, value } => {
                write!(f, "courier {courier_id}: invalid time '{value}', expected HH:MM")
            }
            ScheduleError::EmptySlot { courier_id, date, start, end } => {
                write!(f, "courier {courier_id} on {date}: timeslot {start}-{end} does not end after it starts")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// One courier's working days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierSchedule {
    pub courier_id: CourierId,
    pub country_code: Option<String>,
    pub days: Vec<ScheduleDay>,
}

/// A working day. It gets a capacity record even when it lists no timeslots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDay {
    pub date: NaiveDate,
    pub slots: Vec<ScheduledSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledSlot {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub supported_addresses: Vec<String>,
}

impl CourierSchedule {
    pub fn slot_count(&self) -> usize {
        self.days.iter().map(|d| d.slots.len()).sum()
    }
}

#[derive(Deserialize)]
struct RawCourier {
    courier_id: CourierId,
    #[serde(default)]
    country_code: Option<String>,
    timeslots: BTreeMap<String, Vec<(String, String, Vec<String>)>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSchedule {
    One(RawCourier),
    Many(Vec<RawCourier>),
}

pub fn parse_schedule(json: &str) -> Result<Vec<CourierSchedule>, ScheduleError> {
    let raw: RawSchedule =
        serde_json::from_str(json).map_err(|e| ScheduleError::Format(e.to_string()))?;
    let couriers = match raw {
        RawSchedule::One(c) => vec![c],
        RawSchedule::Many(cs) => cs,
    };
    couriers.into_iter().map(convert_courier).collect()
}

pub fn load_schedule_file(path: &Path) -> Result<Vec<CourierSchedule>, ScheduleError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ScheduleError::Io(format!("{}: {e}", path.display())))?;
    parse_schedule(&text)
}

fn convert_courier(raw: RawCourier) -> Result<CourierSchedule, ScheduleError> {
    let courier_id = raw.courier_id;
    let mut days = Vec::with_capacity(raw.timeslots.len());
    for (date_str, entries) in raw.timeslots {
        let date = NaiveDate::parse_from_str(date_str.trim(), DATE_FORMAT).map_err(|_| {
            ScheduleError::InvalidDate { courier_id, value: date_str.clone() }
        })?;
        let mut slots = Vec::with_capacity(entries.len());
        for (start_str, end_str, supported_addresses) in entries {
            let start = parse_time(courier_id, &start_str)?;
            let end = parse_time(courier_id, &end_str)?;
            if end <= start {
                return Err(ScheduleError::EmptySlot {
                    courier_id,
                    date,
                    start: start_str,
                    end: end_str,
                });
            }
            slots.push(ScheduledSlot {
                start: date.and_time(start),
                end: date.and_time(end),
                supported_addresses,
            });
        }
        days.push(ScheduleDay { date, slots });
    }
    days.sort_by_key(|d| d.date);
    Ok(CourierSchedule {
        courier_id,
        country_code: raw.country_code.filter(|c| !c.trim().is_empty()),
        days,
    })
}

fn parse_time(courier_id: CourierId, value: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT).map_err(|_| ScheduleError::InvalidTime {
        courier_id,
        value: value.to_string(),
    })
}
