//! Capacity bookkeeping for timeslots and courier days.
//!
//! These functions are the only code that changes `scheduled`, `remaining`
//! or either status field. The engine runs them on staged copies while it
//! holds the row locks, and again on the live records when an event is
//! applied, so validation and application can never disagree.

use chrono::NaiveDate;

use crate::limits::{MAX_COURIER_DELIVERIES, MAX_TIMESLOT_DELIVERIES};
use crate::model::*;

use super::EngineError;

/// Take one unit of timeslot capacity. Returns the courier day that must be
/// charged for it.
pub(crate) fn reserve_timeslot(ts: &mut Timeslot) -> Result<(CourierId, NaiveDate), EngineError> {
    if ts.status != TimeslotStatus::Available {
        return Err(EngineError::SlotUnavailable(ts.id));
    }
    if ts.is_full() {
        tracing::error!(timeslot_id = %ts.id, scheduled = ts.scheduled, "full timeslot marked available");
        return Err(EngineError::InvariantViolation(format!(
            "timeslot {} is available with {} of {} deliveries scheduled",
            ts.id, ts.scheduled, MAX_TIMESLOT_DELIVERIES
        )));
    }
    ts.scheduled += 1;
    if ts.is_full() {
        ts.status = TimeslotStatus::NotAvailable;
    }
    Ok((ts.courier_id, ts.date))
}

/// Return one unit of timeslot capacity. Holiday exclusion survives.
pub(crate) fn release_timeslot(ts: &mut Timeslot) {
    if ts.scheduled > 0 {
        ts.scheduled -= 1;
    } else {
        tracing::error!(timeslot_id = %ts.id, "released timeslot with nothing scheduled");
    }
    if !ts.holiday && ts.status == TimeslotStatus::NotAvailable {
        ts.status = TimeslotStatus::Available;
    }
}

/// Exclude a timeslot because its date is a holiday. Returns false when it
/// was already excluded.
pub(crate) fn mark_holiday(ts: &mut Timeslot) -> bool {
    if ts.holiday {
        return false;
    }
    ts.holiday = true;
    ts.status = TimeslotStatus::NotAvailable;
    true
}

pub(crate) fn reserve_courier(c: &mut CourierCapacity) -> Result<(), EngineError> {
    if c.remaining == 0 {
        tracing::error!(
            courier_id = c.courier_id,
            date = %c.date,
            "courier quota exhausted while a timeslot still had room"
        );
        return Err(EngineError::CapacityExceeded(c.courier_id, c.date));
    }
    c.remaining -= 1;
    if c.remaining == 0 {
        c.status = CourierStatus::Full;
    }
    Ok(())
}

pub(crate) fn release_courier(c: &mut CourierCapacity) -> Result<(), EngineError> {
    if c.remaining >= MAX_COURIER_DELIVERIES {
        tracing::error!(
            courier_id = c.courier_id,
            date = %c.date,
            "courier release above maximum quota"
        );
        return Err(EngineError::InvariantViolation(format!(
            "courier {} on {} already has all {} deliveries free",
            c.courier_id, c.date, MAX_COURIER_DELIVERIES
        )));
    }
    c.remaining += 1;
    c.status = CourierStatus::Available;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use ulid::Ulid;

    fn slot() -> Timeslot {
        let start = NaiveDate::from_ymd_opt(2021, 7, 19)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        Timeslot::new(Ulid::new(), 4, start, start + chrono::Duration::hours(2), BTreeSet::new())
    }

    fn courier() -> CourierCapacity {
        CourierCapacity::new(4, NaiveDate::from_ymd_opt(2021, 7, 19).unwrap(), None)
    }

    fn assert_timeslot_invariant(ts: &Timeslot) {
        assert!(ts.scheduled <= MAX_TIMESLOT_DELIVERIES);
        if ts.scheduled == MAX_TIMESLOT_DELIVERIES || ts.holiday {
            assert_eq!(ts.status, TimeslotStatus::NotAvailable);
        } else {
            assert_eq!(ts.status, TimeslotStatus::Available);
        }
    }

    fn assert_courier_invariant(c: &CourierCapacity) {
        assert!(c.remaining <= MAX_COURIER_DELIVERIES);
        assert_eq!(c.status == CourierStatus::Full, c.remaining == 0);
    }

    #[test]
    fn timeslot_fills_at_two() {
        let mut ts = slot();
        assert_eq!(reserve_timeslot(&mut ts).unwrap(), (4, ts.date));
        assert_eq!(ts.scheduled, 1);
        assert_eq!(ts.status, TimeslotStatus::Available);

        reserve_timeslot(&mut ts).unwrap();
        assert_eq!(ts.scheduled, 2);
        assert_eq!(ts.status, TimeslotStatus::NotAvailable);

        let id = ts.id;
        assert_eq!(reserve_timeslot(&mut ts), Err(EngineError::SlotUnavailable(id)));
        assert_eq!(ts.scheduled, 2);
    }

    #[test]
    fn release_reopens_capacity_full_slot() {
        let mut ts = slot();
        reserve_timeslot(&mut ts).unwrap();
        reserve_timeslot(&mut ts).unwrap();
        release_timeslot(&mut ts);
        assert_eq!(ts.scheduled, 1);
        assert_eq!(ts.status, TimeslotStatus::Available);
        assert_timeslot_invariant(&ts);
    }

    #[test]
    fn release_keeps_holiday_exclusion() {
        let mut ts = slot();
        reserve_timeslot(&mut ts).unwrap();
        assert!(mark_holiday(&mut ts));
        release_timeslot(&mut ts);
        assert_eq!(ts.scheduled, 0);
        assert_eq!(ts.status, TimeslotStatus::NotAvailable);
        assert_timeslot_invariant(&ts);
    }

    #[test]
    fn holiday_on_full_slot_survives_release() {
        let mut ts = slot();
        reserve_timeslot(&mut ts).unwrap();
        reserve_timeslot(&mut ts).unwrap();
        assert!(mark_holiday(&mut ts));
        release_timeslot(&mut ts);
        assert_eq!(ts.status, TimeslotStatus::NotAvailable);
    }

    #[test]
    fn mark_holiday_is_idempotent() {
        let mut ts = slot();
        assert!(mark_holiday(&mut ts));
        let snapshot = ts.clone();
        assert!(!mark_holiday(&mut ts));
        assert_eq!(ts, snapshot);
    }

    #[test]
    fn release_of_empty_slot_stays_at_zero() {
        let mut ts = slot();
        release_timeslot(&mut ts);
        assert_eq!(ts.scheduled, 0);
        assert_timeslot_invariant(&ts);
    }

    #[test]
    fn courier_drains_to_full_and_back() {
        let mut c = courier();
        for _ in 0..MAX_COURIER_DELIVERIES {
            reserve_courier(&mut c).unwrap();
            assert_courier_invariant(&c);
        }
        assert_eq!(c.status, CourierStatus::Full);
        assert!(matches!(reserve_courier(&mut c), Err(EngineError::CapacityExceeded(4, _))));
        assert_eq!(c.remaining, 0);

        release_courier(&mut c).unwrap();
        assert_eq!(c.remaining, 1);
        assert_eq!(c.status, CourierStatus::Available);
    }

    #[test]
    fn courier_release_above_max_rejected() {
        let mut c = courier();
        let err = release_courier(&mut c).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert!(err.is_defect());
        assert_eq!(c.remaining, MAX_COURIER_DELIVERIES);
    }

    #[test]
    fn interleaved_operations_hold_invariants() {
        let mut ts = slot();
        let mut c = courier();
        let ops = [true, true, false, true, false, false, true, true, true, false];
        for reserve in ops {
            if reserve {
                if reserve_timeslot(&mut ts).is_ok() {
                    reserve_courier(&mut c).unwrap();
                }
            } else if ts.scheduled > 0 {
                release_timeslot(&mut ts);
                release_courier(&mut c).unwrap();
            }
            assert_timeslot_invariant(&ts);
            assert_courier_invariant(&c);
            assert_eq!(MAX_COURIER_DELIVERIES - c.remaining, ts.scheduled);
        }
    }
}
