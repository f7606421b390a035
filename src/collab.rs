//! Lookups the engine depends on but does not implement: turning a stored
//! address into a structured one, and listing a country's holidays.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;

use crate::model::Address;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    NotFound(String),
    Transport(String),
    Timeout(Duration),
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::NotFound(what) => write!(f, "not found: {what}"),
            LookupError::Transport(msg) => write!(f, "lookup failed: {msg}"),
            LookupError::Timeout(after) => write!(f, "lookup timed out after {after:?}"),
        }
    }
}

impl std::error::Error for LookupError {}

#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, address: &str) -> Result<Address, LookupError>;
}

#[async_trait]
pub trait HolidayOracle: Send + Sync {
    async fn holidays(&self, country_code: &str, year: i32) -> Result<BTreeSet<NaiveDate>, LookupError>;
}

/// The two lookups plus the time budget each call gets.
#[derive(Clone)]
pub struct Collaborators {
    pub addresses: Arc<dyn AddressResolver>,
    pub holidays: Arc<dyn HolidayOracle>,
    pub timeout: Duration,
}

impl Collaborators {
    pub fn new(addresses: Arc<dyn AddressResolver>, holidays: Arc<dyn HolidayOracle>) -> Self {
        Self { addresses, holidays, timeout: DEFAULT_LOOKUP_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve under the time budget. A timeout becomes `LookupError::Timeout`.
    pub async fn resolve_address(&self, address: &str) -> Result<Address, LookupError> {
        match tokio::time::timeout(self.timeout, self.addresses.resolve(address)).await {
            Ok(result) => result,
            Err(_) => Err(LookupError::Timeout(self.timeout)),
        }
    }

    /// Holidays for every year in `years`. Any failing year fails the whole
    /// lookup; callers fall back to no holidays.
    pub async fn holidays_for(
        &self,
        country_code: &str,
        years: &BTreeSet<i32>,
    ) -> Result<BTreeSet<NaiveDate>, LookupError> {
        let lookup = async {
            let mut dates = BTreeSet::new();
            for &year in years {
                dates.extend(self.holidays.holidays(country_code, year).await?);
            }
            Ok(dates)
        };
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(LookupError::Timeout(self.timeout)),
        }
    }
}

// ── In-memory implementations ────────────────────────────

/// Fixed address → `Address` table.
#[derive(Debug, Default, Clone)]
pub struct AddressBook {
    entries: HashMap<String, Address>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, raw: impl Into<String>, address: Address) {
        self.entries.insert(raw.into(), address);
    }

    /// Load `{"<free text address>": {"street": .., "city": .., ...}, ...}`.
    pub fn load(path: &Path) -> Result<Self, LookupError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LookupError::Transport(format!("{}: {e}", path.display())))?;
        let entries: HashMap<String, Address> = serde_json::from_str(&text)
            .map_err(|e| LookupError::Transport(format!("{}: {e}", path.display())))?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AddressResolver for AddressBook {
    async fn resolve(&self, address: &str) -> Result<Address, LookupError> {
        self.entries
            .get(address.trim())
            .cloned()
            .ok_or_else(|| LookupError::NotFound(address.to_string()))
    }
}

/// Holiday dates per country code.
#[derive(Debug, Default, Clone)]
pub struct HolidayCalendar {
    by_country: HashMap<String, BTreeSet<NaiveDate>>,
}

#[derive(Deserialize)]
#[serde(transparent)]
struct CalendarFile(HashMap<String, Vec<NaiveDate>>);

impl HolidayCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, country_code: impl Into<String>, date: NaiveDate) {
        self.by_country.entry(country_code.into()).or_default().insert(date);
    }

    /// Load `{"IL": ["2021-07-18", ...], ...}`.
    pub fn load(path: &Path) -> Result<Self, LookupError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LookupError::Transport(format!("{}: {e}", path.display())))?;
        let CalendarFile(raw) = serde_json::from_str(&text)
            .map_err(|e| LookupError::Transport(format!("{}: {e}", path.display())))?;
        let by_country = raw
            .into_iter()
            .map(|(country, dates)| (country, dates.into_iter().collect()))
            .collect();
        Ok(Self { by_country })
    }
}

#[async_trait]
impl HolidayOracle for HolidayCalendar {
    async fn holidays(&self, country_code: &str, year: i32) -> Result<BTreeSet<NaiveDate>, LookupError> {
        Ok(self
            .by_country
            .get(country_code)
            .map(|dates| dates.iter().filter(|d| d.year() == year).copied().collect())
            .unwrap_or_default())
    }
}
