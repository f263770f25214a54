use crate::change_notifier::ChangeBatch;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use thiserror::Error;

/// Raw value published on a path
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Double(f64),
    Int(i32),
    Text(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Double(value) => write!(f, "{value}"),
            AttributeValue::Int(value) => write!(f, "{value}"),
            AttributeValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

/// The value and display text of one path, kept together so they never drift apart
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEntry {
    pub value: AttributeValue,
    pub text: String,
}

impl AttributeEntry {
    pub fn new(value: impl Into<AttributeValue>, text: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            text: text.into(),
        }
    }
}

/// A numeric reading destined for one path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub path: &'static str,
    pub value: f64,
    pub unit: &'static str,
    pub precision: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("attribute store not initialized")]
    NotInitialized,
    #[error("unknown path {0}")]
    UnknownPath(String),
}

type Entries = HashMap<String, AttributeEntry>;

/// Published device state, shared between the receive loop and bus callers.
///
/// Starts out uninitialized; every query before [`AttributeStore::initialize`]
/// fails with [`StoreError::NotInitialized`].
#[derive(Debug, Default)]
pub struct AttributeStore {
    entries: RwLock<Option<Entries>>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an already initialized store
    pub fn with_entries<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, AttributeEntry)>,
        P: Into<String>,
    {
        let store = Self::new();
        store.initialize(entries);
        store
    }

    /// Replaces the whole state with `entries`
    pub fn initialize<I, P>(&self, entries: I)
    where
        I: IntoIterator<Item = (P, AttributeEntry)>,
        P: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(path, entry)| (path.into(), entry))
            .collect();
        *self.write() = Some(entries);
    }

    pub fn is_initialized(&self) -> bool {
        self.read().is_some()
    }

    pub fn get(&self, path: &str) -> Result<AttributeEntry, StoreError> {
        let guard = self.read();
        let entries = guard.as_ref().ok_or(StoreError::NotInitialized)?;
        entries
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::UnknownPath(path.to_string()))
    }

    /// Stores a new reading if it differs from the current value.
    ///
    /// Returns whether the path changed. An unchanged value leaves the entry untouched.
    pub fn apply_measurement(
        &self,
        path: &str,
        value: f64,
        unit: &str,
        precision: usize,
    ) -> Result<bool, StoreError> {
        let mut guard = self.write();
        let entries = guard.as_mut().ok_or(StoreError::NotInitialized)?;
        Ok(apply_to(entries, path, value, unit, precision).is_some())
    }

    /// Applies a whole frame worth of readings under a single write lock and
    /// returns only the entries that changed.
    pub fn apply_measurements(
        &self,
        measurements: &[Measurement],
    ) -> Result<ChangeBatch, StoreError> {
        let mut guard = self.write();
        let entries = guard.as_mut().ok_or(StoreError::NotInitialized)?;
        let mut changed = ChangeBatch::new();
        for m in measurements {
            if let Some(entry) = apply_to(entries, m.path, m.value, m.unit, m.precision) {
                changed.insert(m.path.to_string(), entry);
            }
        }
        Ok(changed)
    }

    /// Unconditional write from a bus caller to a published path. Only the raw
    /// value is replaced and no change notification follows.
    pub fn set_raw(&self, path: &str, value: AttributeValue) -> Result<(), StoreError> {
        let mut guard = self.write();
        let entries = guard.as_mut().ok_or(StoreError::NotInitialized)?;
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| StoreError::UnknownPath(path.to_string()))?;
        entry.value = value;
        Ok(())
    }

    /// Copy of every entry, ordered by path
    pub fn snapshot_all(&self) -> Result<BTreeMap<String, AttributeEntry>, StoreError> {
        let guard = self.read();
        let entries = guard.as_ref().ok_or(StoreError::NotInitialized)?;
        Ok(entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect())
    }

    // Entries are plain data, a poisoned lock still guards a usable map
    fn read(&self) -> RwLockReadGuard<'_, Option<Entries>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Entries>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Display text for a reading, e.g. `1909.00W`
pub fn format_measurement(value: f64, unit: &str, precision: usize) -> String {
    format!("{value:.precision$}{unit}")
}

fn apply_to(
    entries: &mut Entries,
    path: &str,
    value: f64,
    unit: &str,
    precision: usize,
) -> Option<AttributeEntry> {
    let raw = AttributeValue::Double(value);
    if entries.get(path).is_some_and(|entry| entry.value == raw) {
        return None;
    }
    let entry = AttributeEntry {
        value: raw,
        text: format_measurement(value, unit, precision),
    };
    entries.insert(path.to_string(), entry.clone());
    Some(entry)
}
