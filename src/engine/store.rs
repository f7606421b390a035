use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::capacity::{mark_holiday, release_courier, release_timeslot, reserve_courier, reserve_timeslot};
use super::EngineError;

pub type SharedTimeslot = Arc<RwLock<Timeslot>>;
pub type SharedCourier = Arc<RwLock<CourierCapacity>>;
pub type CourierKey = (CourierId, NaiveDate);

/// Held while a booking with a chosen delivery id is in flight.
pub struct DeliveryIdClaim<'a> {
    store: &'a Store,
    id: Ulid,
}

impl Drop for DeliveryIdClaim<'_> {
    fn drop(&mut self) {
        self.store.claimed_ids.remove(&self.id);
    }
}

/// Every record the engine owns. Timeslots and courier days sit behind their
/// own lock (the row lock); deliveries and users are plain map entries
/// whose writers already hold the relevant row lock.
pub struct Store {
    timeslots: DashMap<Ulid, SharedTimeslot>,
    couriers: DashMap<CourierKey, SharedCourier>,
    deliveries: DashMap<Ulid, Delivery>,
    /// Delivery ids held by a booking between validation and apply.
    claimed_ids: DashSet<Ulid>,
    users: DashMap<Ulid, User>,
    emails: DashMap<String, Ulid>,
    /// Date → timeslots on that date. A timeslot's date never changes.
    by_date: DashMap<NaiveDate, Vec<Ulid>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            timeslots: DashMap::new(),
            couriers: DashMap::new(),
            deliveries: DashMap::new(),
            claimed_ids: DashSet::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            by_date: DashMap::new(),
        }
    }

    // ── Timeslots and courier days ───────────────────────────

    pub fn get_timeslot(&self, id: &Ulid) -> Option<SharedTimeslot> {
        self.timeslots.get(id).map(|e| e.value().clone())
    }

    pub fn get_courier(&self, courier_id: CourierId, date: NaiveDate) -> Option<SharedCourier> {
        self.couriers.get(&(courier_id, date)).map(|e| e.value().clone())
    }

    pub fn timeslot_count(&self) -> usize {
        self.timeslots.len()
    }

    pub fn timeslot_ids(&self) -> Vec<Ulid> {
        self.timeslots.iter().map(|e| *e.key()).collect()
    }

    pub fn courier_keys(&self) -> Vec<CourierKey> {
        self.couriers.iter().map(|e| *e.key()).collect()
    }

    pub fn timeslots_on(&self, date: NaiveDate) -> Vec<Ulid> {
        self.by_date
            .get(&date)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Deliveries ───────────────────────────────────────────

    pub fn get_delivery(&self, id: &Ulid) -> Option<Delivery> {
        self.deliveries.get(id).map(|e| e.value().clone())
    }

    /// Reserve `id` for one booking. `None` when the id is taken or another
    /// booking holds it. The claim is released when the guard drops.
    pub fn claim_delivery_id(&self, id: Ulid) -> Option<DeliveryIdClaim<'_>> {
        if !self.claimed_ids.insert(id) {
            return None;
        }
        let claim = DeliveryIdClaim { store: self, id };
        if self.deliveries.contains_key(&id) {
            return None;
        }
        Some(claim)
    }

    pub fn deliveries_where(&self, pred: impl Fn(&Delivery) -> bool) -> Vec<Delivery> {
        self.deliveries
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    // ── Users ────────────────────────────────────────────────

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn user_ids(&self) -> Vec<Ulid> {
        self.users.iter().map(|e| *e.key()).collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn email_taken(&self, email: &str) -> bool {
        self.emails.contains_key(email)
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event that creates or removes records, or touches users.
    /// Events that change capacity go through `apply_row_event`.
    pub fn apply_structural(&self, event: &Event) {
        match event {
            Event::ScheduleCleared => {
                self.timeslots.clear();
                self.couriers.clear();
                self.deliveries.clear();
                self.by_date.clear();
            }
            Event::CourierDayAdded { courier_id, date, country_code } => {
                let record = CourierCapacity::new(*courier_id, *date, country_code.clone());
                self.couriers
                    .insert((*courier_id, *date), Arc::new(RwLock::new(record)));
            }
            Event::TimeslotAdded { id, courier_id, start, end, supported_addresses } => {
                let cities: BTreeSet<String> = supported_addresses.iter().cloned().collect();
                let ts = Timeslot::new(*id, *courier_id, *start, *end, cities);
                self.by_date.entry(ts.date).or_default().push(*id);
                self.timeslots.insert(*id, Arc::new(RwLock::new(ts)));
            }
            Event::UserRegistered { id, name, email, address, country_code } => {
                self.emails.insert(email.clone(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        address: address.clone(),
                        country_code: country_code.clone(),
                        resolved: None,
                    },
                );
            }
            Event::AddressResolved { user_id, address } => {
                if let Some(mut user) = self.users.get_mut(user_id) {
                    user.resolved = Some(address.clone());
                }
            }
            Event::TimeslotHolidayMarked { .. }
            | Event::DeliveryBooked { .. }
            | Event::DeliveryCancelled { .. }
            | Event::DeliveryCompleted { .. } => {}
        }
    }

    /// Apply a capacity event to locked rows. The caller holds the write
    /// lock on `ts` and, for bookings and cancellations, on `courier`.
    pub fn apply_row_event(
        &self,
        ts: &mut Timeslot,
        courier: Option<&mut CourierCapacity>,
        event: &Event,
    ) -> Result<(), EngineError> {
        match event {
            Event::TimeslotHolidayMarked { .. } => {
                mark_holiday(ts);
            }
            Event::DeliveryBooked { id, timeslot_id, courier_id, user_id, date } => {
                let courier = courier.ok_or(EngineError::CourierNotFound(*courier_id, *date))?;
                if self.deliveries.contains_key(id) {
                    return Err(EngineError::AlreadyExists(format!("delivery {id}")));
                }
                reserve_timeslot(ts)?;
                reserve_courier(courier)?;
                self.deliveries.insert(
                    *id,
                    Delivery {
                        id: *id,
                        timeslot_id: *timeslot_id,
                        courier_id: *courier_id,
                        user_id: *user_id,
                        date: *date,
                        status: DeliveryStatus::Scheduled,
                    },
                );
            }
            Event::DeliveryCancelled { id, courier_id, date, .. } => {
                let courier = courier.ok_or(EngineError::CourierNotFound(*courier_id, *date))?;
                release_courier(courier)?;
                release_timeslot(ts);
                self.deliveries.remove(id);
            }
            Event::DeliveryCompleted { id, .. } => {
                let mut delivery = self
                    .deliveries
                    .get_mut(id)
                    .ok_or(EngineError::DeliveryNotFound(*id))?;
                delivery.status = DeliveryStatus::Completed;
            }
            other => {
                return Err(EngineError::InvariantViolation(format!(
                    "not a row event: {other:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Timeslot row an event locks, if any.
pub(super) fn event_timeslot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::TimeslotHolidayMarked { id } => Some(*id),
        Event::DeliveryBooked { timeslot_id, .. }
        | Event::DeliveryCancelled { timeslot_id, .. }
        | Event::DeliveryCompleted { timeslot_id, .. } => Some(*timeslot_id),
        Event::ScheduleCleared
        | Event::CourierDayAdded { .. }
        | Event::TimeslotAdded { .. }
        | Event::UserRegistered { .. }
        | Event::AddressResolved { .. } => None,
    }
}

/// Courier row an event locks, if any.
pub(super) fn event_courier_key(event: &Event) -> Option<CourierKey> {
    match event {
        Event::DeliveryBooked { courier_id, date, .. }
        | Event::DeliveryCancelled { courier_id, date, .. } => Some((*courier_id, *date)),
        _ => None,
    }
}
