use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn report_order(mut rows: Vec<Delivery>) -> Vec<Delivery> {
    rows.sort_by_key(|d| (d.date, d.id));
    rows
}

impl Engine {
    /// Deliveries dated exactly `date`.
    pub fn daily_deliveries(&self, date: NaiveDate) -> Vec<Delivery> {
        report_order(self.store.deliveries_where(|d| d.date == date))
    }

    /// Deliveries in the seven days starting at `week_start`.
    pub fn weekly_deliveries(&self, week_start: NaiveDate) -> Result<Vec<Delivery>, EngineError> {
        self.deliveries_between(week_start, WEEK_DAYS)
    }

    /// Deliveries dated in `[start, start + days)`.
    pub fn deliveries_between(&self, start: NaiveDate, days: u32) -> Result<Vec<Delivery>, EngineError> {
        if days == 0 {
            return Ok(Vec::new());
        }
        if days > MAX_REPORT_DAYS {
            return Err(EngineError::LimitExceeded("reporting window too wide"));
        }
        let end = start
            .checked_add_days(Days::new(days as u64))
            .ok_or(EngineError::LimitExceeded("reporting window past the calendar"))?;
        Ok(report_order(
            self.store.deliveries_where(|d| d.date >= start && d.date < end),
        ))
    }

    pub fn get_delivery(&self, id: &Ulid) -> Option<Delivery> {
        self.store.get_delivery(id)
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.store.get_user(id)
    }

    pub fn user_count(&self) -> usize {
        self.store.user_count()
    }

    pub async fn get_timeslot(&self, id: &Ulid) -> Option<Timeslot> {
        let ts = self.store.get_timeslot(id)?;
        let guard = ts.read().await;
        Some(guard.clone())
    }

    pub async fn get_courier_capacity(&self, courier_id: CourierId, date: NaiveDate) -> Option<CourierCapacity> {
        let c = self.store.get_courier(courier_id, date)?;
        let guard = c.read().await;
        Some(guard.clone())
    }

    /// Every timeslot, or those on `date`, ordered by start time.
    pub async fn list_timeslots(&self, date: Option<NaiveDate>) -> Vec<Timeslot> {
        let ids = match date {
            Some(date) => self.store.timeslots_on(date),
            None => self.store.timeslot_ids(),
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ts) = self.store.get_timeslot(&id) {
                out.push(ts.read().await.clone());
            }
        }
        out.sort_by_key(|ts| (ts.start, ts.id));
        out
    }
}
