use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    BOOKINGS_TOTAL, CANCELLATIONS_TOTAL, COMPLETIONS_TOTAL, HOLIDAY_TRANSITIONS_TOTAL,
    SCHEDULE_TIMESLOTS,
};
use crate::schedule::CourierSchedule;

use super::capacity::{release_courier, reserve_courier, reserve_timeslot};
use super::{Engine, EngineError};

fn outcome<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    }
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        id: Ulid,
        name: &str,
        email: &str,
        address: &str,
        country_code: &str,
    ) -> Result<(), EngineError> {
        let (name, email, address, country_code) =
            (name.trim(), email.trim(), address.trim(), country_code.trim());
        if name.is_empty() || address.is_empty() || country_code.is_empty() {
            return Err(EngineError::LimitExceeded("name, address and country code are required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        if address.len() > MAX_ADDRESS_LEN {
            return Err(EngineError::LimitExceeded("address too long"));
        }
        if country_code.len() > MAX_COUNTRY_CODE_LEN {
            return Err(EngineError::LimitExceeded("country code too long"));
        }

        let _gate = self.schedule_gate.read().await;
        let _registration = self.registration.lock().await;
        if self.store.get_user(&id).is_some() {
            return Err(EngineError::AlreadyExists(format!("user {id}")));
        }
        if self.store.email_taken(email) {
            return Err(EngineError::AlreadyExists(format!("user with email {email}")));
        }

        let event = Event::UserRegistered {
            id,
            name: name.to_string(),
            email: email.to_string(),
            address: address.to_string(),
            country_code: country_code.to_string(),
        };
        self.persist_structural(&event).await?;
        tracing::info!(user_id = %id, "user registered");
        Ok(())
    }

    /// The user's structured address, resolved once and then cached.
    pub async fn resolve_user_address(&self, user_id: Ulid) -> Result<Address, EngineError> {
        let user = self
            .store
            .get_user(&user_id)
            .ok_or(EngineError::UserNotFound(user_id))?;
        if let Some(address) = user.resolved {
            return Ok(address);
        }

        let address = match self.collab.resolve_address(&user.address).await {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "address lookup failed");
                return Err(EngineError::AddressUnresolved(user_id));
            }
        };

        let _gate = self.schedule_gate.read().await;
        let event = Event::AddressResolved { user_id, address: address.clone() };
        self.persist_structural(&event).await?;
        Ok(address)
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn book(&self, user_id: Ulid, timeslot_id: Ulid) -> Result<Ulid, EngineError> {
        let id = Ulid::new();
        self.book_with_id(id, user_id, timeslot_id).await?;
        Ok(id)
    }

    /// Book one delivery. The timeslot and its courier day are both charged
    /// by a single logged event, or neither is.
    pub async fn book_with_id(
        &self,
        id: Ulid,
        user_id: Ulid,
        timeslot_id: Ulid,
    ) -> Result<(), EngineError> {
        let result = self.try_book(id, user_id, timeslot_id).await;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome(&result)).increment(1);
        match &result {
            Ok(()) => tracing::info!(delivery_id = %id, %user_id, %timeslot_id, "delivery booked"),
            Err(e) if e.is_defect() => {
                tracing::error!(delivery_id = %id, %timeslot_id, error = %e, "booking hit inconsistent records")
            }
            Err(e) => tracing::debug!(%timeslot_id, error = %e, "booking rejected"),
        }
        result
    }

    async fn try_book(&self, id: Ulid, user_id: Ulid, timeslot_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.schedule_gate.read().await;
        if self.store.get_user(&user_id).is_none() {
            return Err(EngineError::UserNotFound(user_id));
        }
        // Held until the booking is applied or rejected, so two bookings
        // with one id cannot both pass on different couriers' locks.
        let _claim = self
            .store
            .claim_delivery_id(id)
            .ok_or_else(|| EngineError::AlreadyExists(format!("delivery {id}")))?;
        let ts = self
            .store
            .get_timeslot(&timeslot_id)
            .ok_or(EngineError::TimeslotNotFound(timeslot_id))?;
        let mut ts_guard = ts.write().await;
        let courier = self
            .store
            .get_courier(ts_guard.courier_id, ts_guard.date)
            .ok_or(EngineError::CourierNotFound(ts_guard.courier_id, ts_guard.date))?;
        let mut courier_guard = courier.write().await;

        // Stage on copies; the live rows change only once the event is durable.
        let mut staged_ts = ts_guard.clone();
        let (courier_id, date) = reserve_timeslot(&mut staged_ts)?;
        let mut staged_courier = courier_guard.clone();
        reserve_courier(&mut staged_courier)?;

        let event = Event::DeliveryBooked { id, timeslot_id, courier_id, user_id, date };
        self.persist_and_apply(&mut ts_guard, Some(&mut courier_guard), &event)
            .await
    }

    /// Cancel a scheduled delivery and give its capacity back.
    pub async fn cancel(&self, delivery_id: Ulid) -> Result<(), EngineError> {
        let result = self.try_cancel(delivery_id).await;
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => outcome(&result)).increment(1);
        match &result {
            Ok(()) => tracing::info!(%delivery_id, "delivery cancelled"),
            Err(e) if e.is_defect() => {
                tracing::error!(%delivery_id, error = %e, "cancellation hit inconsistent records")
            }
            Err(e) => tracing::debug!(%delivery_id, error = %e, "cancellation rejected"),
        }
        result
    }

    async fn try_cancel(&self, delivery_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.schedule_gate.read().await;
        let delivery = self
            .store
            .get_delivery(&delivery_id)
            .ok_or(EngineError::DeliveryNotFound(delivery_id))?;
        let ts = self.store.get_timeslot(&delivery.timeslot_id).ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "delivery {delivery_id} points at missing timeslot {}",
                delivery.timeslot_id
            ))
        })?;
        let mut ts_guard = ts.write().await;

        // A concurrent cancel may have won while we waited for the row.
        let delivery = self
            .store
            .get_delivery(&delivery_id)
            .ok_or(EngineError::DeliveryNotFound(delivery_id))?;
        if delivery.status == DeliveryStatus::Completed {
            return Err(EngineError::DeliveryCompleted(delivery_id));
        }
        if ts_guard.scheduled == 0 {
            return Err(EngineError::InvariantViolation(format!(
                "timeslot {} has no scheduled deliveries but delivery {delivery_id} exists",
                ts_guard.id
            )));
        }

        let courier = self
            .store
            .get_courier(delivery.courier_id, delivery.date)
            .ok_or(EngineError::CourierNotFound(delivery.courier_id, delivery.date))?;
        let mut courier_guard = courier.write().await;
        let mut staged_courier = courier_guard.clone();
        release_courier(&mut staged_courier)?;

        let event = Event::DeliveryCancelled {
            id: delivery_id,
            timeslot_id: delivery.timeslot_id,
            courier_id: delivery.courier_id,
            date: delivery.date,
        };
        self.persist_and_apply(&mut ts_guard, Some(&mut courier_guard), &event)
            .await
    }

    /// Mark a delivery completed. Completing twice is a no-op.
    pub async fn complete(&self, delivery_id: Ulid) -> Result<(), EngineError> {
        let result = self.try_complete(delivery_id).await;
        metrics::counter!(COMPLETIONS_TOTAL, "outcome" => outcome(&result)).increment(1);
        result
    }

    async fn try_complete(&self, delivery_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.schedule_gate.read().await;
        let delivery = self
            .store
            .get_delivery(&delivery_id)
            .ok_or(EngineError::DeliveryNotFound(delivery_id))?;
        let ts = self
            .store
            .get_timeslot(&delivery.timeslot_id)
            .ok_or(EngineError::TimeslotNotFound(delivery.timeslot_id))?;
        let mut ts_guard = ts.write().await;

        let delivery = self
            .store
            .get_delivery(&delivery_id)
            .ok_or(EngineError::DeliveryNotFound(delivery_id))?;
        if delivery.status == DeliveryStatus::Completed {
            return Ok(());
        }
        let event = Event::DeliveryCompleted { id: delivery_id, timeslot_id: delivery.timeslot_id };
        self.persist_and_apply(&mut ts_guard, None, &event).await?;
        tracing::info!(%delivery_id, "delivery completed");
        Ok(())
    }

    // ── Schedule ─────────────────────────────────────────────

    /// Replace every timeslot, courier day and delivery with `schedule`.
    /// Users survive. Returns the number of timeslots created.
    pub async fn load_schedule(&self, schedule: &[CourierSchedule]) -> Result<usize, EngineError> {
        let total: usize = schedule.iter().map(CourierSchedule::slot_count).sum();
        if total > MAX_TIMESLOTS_PER_LOAD {
            return Err(EngineError::LimitExceeded("too many timeslots in schedule"));
        }

        let mut courier_days: BTreeMap<(CourierId, NaiveDate), Option<String>> = BTreeMap::new();
        let mut slot_events = Vec::with_capacity(total);
        for courier in schedule {
            for day in &courier.days {
                courier_days
                    .entry((courier.courier_id, day.date))
                    .or_insert_with(|| courier.country_code.clone());
                for slot in &day.slots {
                    if slot.end <= slot.start {
                        return Err(EngineError::InvalidSchedule(format!(
                            "courier {} slot {} ends before it starts",
                            courier.courier_id, slot.start
                        )));
                    }
                    if slot.start.date() != day.date {
                        return Err(EngineError::InvalidSchedule(format!(
                            "courier {} slot {} is not on {}",
                            courier.courier_id, slot.start, day.date
                        )));
                    }
                    let cities: BTreeSet<&str> =
                        slot.supported_addresses.iter().map(|s| s.trim()).collect();
                    if cities.len() > MAX_SUPPORTED_ADDRESSES {
                        return Err(EngineError::LimitExceeded("too many supported addresses"));
                    }
                    slot_events.push(Event::TimeslotAdded {
                        id: Ulid::new(),
                        courier_id: courier.courier_id,
                        start: slot.start,
                        end: slot.end,
                        supported_addresses: cities.into_iter().map(String::from).collect(),
                    });
                }
            }
        }

        let mut events = Vec::with_capacity(1 + courier_days.len() + slot_events.len());
        events.push(Event::ScheduleCleared);
        events.extend(courier_days.into_iter().map(|((courier_id, date), country_code)| {
            Event::CourierDayAdded { courier_id, date, country_code }
        }));
        events.extend(slot_events);

        let _gate = self.schedule_gate.write().await;
        self.wal_append_all(&events).await?;
        for event in &events {
            self.store.apply_structural(event);
        }
        metrics::gauge!(SCHEDULE_TIMESLOTS).set(total as f64);
        tracing::info!(couriers = schedule.len(), timeslots = total, "schedule loaded");
        Ok(total)
    }

    // ── Holidays ─────────────────────────────────────────────

    /// Exclude every timeslot on one of `dates` whose courier works in
    /// `country_code` (or names no country). Returns how many timeslots
    /// were newly excluded; already excluded ones are left alone.
    pub async fn mark_holidays(
        &self,
        country_code: &str,
        dates: &BTreeSet<NaiveDate>,
    ) -> Result<usize, EngineError> {
        let _gate = self.schedule_gate.read().await;
        let mut marked = 0;
        for &date in dates {
            for id in self.store.timeslots_on(date) {
                let Some(ts) = self.store.get_timeslot(&id) else { continue };
                let mut ts_guard = ts.write().await;
                if ts_guard.holiday {
                    continue;
                }
                if !self.courier_in_country(ts_guard.courier_id, date, country_code).await {
                    continue;
                }
                let event = Event::TimeslotHolidayMarked { id };
                self.persist_and_apply(&mut ts_guard, None, &event).await?;
                tracing::info!(timeslot_id = %id, %date, country_code, "timeslot excluded for holiday");
                marked += 1;
            }
        }
        if marked > 0 {
            metrics::counter!(HOLIDAY_TRANSITIONS_TOTAL).increment(marked as u64);
        }
        Ok(marked)
    }

    async fn courier_in_country(&self, courier_id: CourierId, date: NaiveDate, country_code: &str) -> bool {
        match self.store.get_courier(courier_id, date) {
            Some(c) => match &c.read().await.country_code {
                Some(code) => code.eq_ignore_ascii_case(country_code),
                None => true,
            },
            None => true,
        }
    }
}
