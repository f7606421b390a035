use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::CourierId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Timeslot is full or excluded as a holiday. The caller picks another slot.
    SlotUnavailable(Ulid),
    UserNotFound(Ulid),
    DeliveryNotFound(Ulid),
    TimeslotNotFound(Ulid),
    CourierNotFound(CourierId, NaiveDate),
    /// Completed deliveries are final and cannot be cancelled.
    DeliveryCompleted(Ulid),
    /// Courier quota exhausted while its timeslot still had room. A defect.
    CapacityExceeded(CourierId, NaiveDate),
    /// Records disagree with each other. A defect.
    InvariantViolation(String),
    AddressUnresolved(Ulid),
    AlreadyExists(String),
    /// A schedule entry that cannot become a timeslot.
    InvalidSchedule(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Errors that indicate corrupted bookkeeping rather than a rejected request.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            EngineError::CapacityExceeded(..) | EngineError::InvariantViolation(_)
        )
    }

    /// Short metric label.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::UserNotFound(_) => "user_not_found",
            EngineError::DeliveryNotFound(_) => "delivery_not_found",
            EngineError::TimeslotNotFound(_) => "timeslot_not_found",
            EngineError::CourierNotFound(..) => "courier_not_found",
            EngineError::DeliveryCompleted(_) => "delivery_completed",
            EngineError::CapacityExceeded(..) => "capacity_exceeded",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::AddressUnresolved(_) => "address_unresolved",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidSchedule(_) => "invalid_schedule",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::UserNotFound(_)
                | EngineError::DeliveryNotFound(_)
                | EngineError::TimeslotNotFound(_)
                | EngineError::CourierNotFound(..)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotUnavailable(id) => write!(f, "timeslot not available: {id}"),
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::DeliveryNotFound(id) => write!(f, "delivery not found: {id}"),
            EngineError::TimeslotNotFound(id) => write!(f, "timeslot not found: {id}"),
            EngineError::CourierNotFound(courier, date) => {
                write!(f, "no capacity record for courier {courier} on {date}")
            }
            EngineError::DeliveryCompleted(id) => {
                write!(f, "delivery {id} is completed and cannot be cancelled")
            }
            EngineError::CapacityExceeded(courier, date) => {
                write!(f, "courier {courier} has no deliveries left on {date}")
            }
            EngineError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            EngineError::AddressUnresolved(id) => {
                write!(f, "address of user {id} could not be resolved")
            }
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::InvalidSchedule(msg) => write!(f, "invalid schedule: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
