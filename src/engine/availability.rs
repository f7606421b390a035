use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::collab::LookupError;
use crate::limits::WEEK_DAYS;
use crate::model::*;
use crate::observability::LOOKUP_FALLBACKS_TOTAL;

use super::{Engine, EngineError};

/// Dates covered by an availability query starting at `week_start`.
pub fn week_window(week_start: NaiveDate) -> Vec<NaiveDate> {
    week_start.iter_days().take(WEEK_DAYS as usize).collect()
}

fn join_failure(e: tokio::task::JoinError) -> LookupError {
    LookupError::Transport(format!("lookup task failed: {e}"))
}

impl Engine {
    /// Timeslots the user can book in the week starting at `week_start`.
    ///
    /// The address and holiday lookups run as two tasks under the lookup
    /// timeout. A failed holiday lookup means no holidays are applied; a
    /// failed address lookup means nothing can be offered, but holidays are
    /// still applied. Both surface as warnings on the report.
    pub async fn availability(
        &self,
        user_id: Ulid,
        week_start: NaiveDate,
    ) -> Result<AvailabilityReport, EngineError> {
        let user = self
            .store
            .get_user(&user_id)
            .ok_or(EngineError::UserNotFound(user_id))?;
        let window = week_window(week_start);
        let years: BTreeSet<i32> = window.iter().map(|d| d.year()).collect();
        let country_code = user
            .resolved
            .as_ref()
            .map_or_else(|| user.country_code.clone(), |a| a.country_code.clone());

        let address_task = user.resolved.is_none().then(|| {
            let collab = self.collab.clone();
            let raw = user.address.clone();
            tokio::spawn(async move { collab.resolve_address(&raw).await })
        });
        let holiday_task = {
            let collab = self.collab.clone();
            let country_code = country_code.clone();
            tokio::spawn(async move { collab.holidays_for(&country_code, &years).await })
        };

        let address = match address_task {
            Some(task) => task.await.unwrap_or_else(|e| Err(join_failure(e))),
            None => user.resolved.clone().ok_or_else(|| LookupError::NotFound(user.address.clone())),
        };
        let holidays = holiday_task.await.unwrap_or_else(|e| Err(join_failure(e)));

        let mut report = AvailabilityReport::default();

        match holidays {
            Ok(dates) => {
                let in_window: BTreeSet<NaiveDate> =
                    dates.into_iter().filter(|d| window.contains(d)).collect();
                report.holidays_marked = self.mark_holidays(&country_code, &in_window).await?;
            }
            Err(e) => {
                tracing::warn!(%user_id, %country_code, error = %e, "holiday lookup failed, applying none");
                metrics::counter!(LOOKUP_FALLBACKS_TOTAL, "lookup" => "holidays").increment(1);
                report.warnings.push(AvailabilityWarning::HolidayLookupFailed {
                    country_code: country_code.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let address = match address {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "address lookup failed, no timeslots offered");
                metrics::counter!(LOOKUP_FALLBACKS_TOTAL, "lookup" => "address").increment(1);
                report.warnings.push(AvailabilityWarning::AddressUnresolved { reason: e.to_string() });
                return Ok(report);
            }
        };
        if user.resolved.is_none() {
            let _gate = self.schedule_gate.read().await;
            let event = Event::AddressResolved { user_id, address: address.clone() };
            self.persist_structural(&event).await?;
        }

        report.slots = self.bookable_in(&window, &address.city).await;
        Ok(report)
    }

    async fn bookable_in(&self, window: &[NaiveDate], city: &str) -> Vec<TimeslotSummary> {
        let mut slots = Vec::new();
        for &date in window {
            for id in self.store.timeslots_on(date) {
                let Some(ts) = self.store.get_timeslot(&id) else { continue };
                let ts = ts.read().await;
                if ts.status != TimeslotStatus::Available || !ts.serves(city) {
                    continue;
                }
                let courier_available = match self.store.get_courier(ts.courier_id, ts.date) {
                    Some(c) => c.read().await.status == CourierStatus::Available,
                    None => false,
                };
                if courier_available {
                    slots.push(TimeslotSummary { timeslot_id: ts.id, start: ts.start, end: ts.end });
                }
            }
        }
        slots.sort_by_key(|s| (s.start, s.timeslot_id));
        slots
    }
}
