//! Key-partitioned item store
//!
//! Single keyspace addressed by a composite `(partition, sort)` key. Items
//! are attribute maps; the conditional-update operation is the atomicity
//! primitive the reconciliation engine and the rate limiter are built on.
//!
//! - `ItemStore`: backend trait (thread-safe, synchronous)
//! - `SledStore`: embedded sled backend
//! - TTL: items carrying a past `ttl` attribute (unix seconds) are invisible
//!   to reads and reclaimed lazily

mod sled_store;

pub use sled_store::SledStore;

use serde_json::Value;

/// Attribute map for a stored item.
///
/// `serde_json::Value` attributes round-trip booleans, strings, numbers
/// (integer vs float preserved by `serde_json::Number`), null, nested maps
/// and nested arrays.
pub type Item = serde_json::Map<String, Value>;

/// Attribute name holding the absolute expiry (unix seconds).
pub const TTL_ATTR: &str = "ttl";

/// Sort component of a composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    Int(i64),
    Str(String),
}

impl From<i64> for SortKey {
    fn from(v: i64) -> Self {
        SortKey::Int(v)
    }
}

impl From<&str> for SortKey {
    fn from(v: &str) -> Self {
        SortKey::Str(v.to_string())
    }
}

impl From<String> for SortKey {
    fn from(v: String) -> Self {
        SortKey::Str(v)
    }
}

/// Composite item key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub partition: String,
    pub sort: SortKey,
}

impl Key {
    pub fn new(partition: impl Into<String>, sort: impl Into<SortKey>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

/// Storage errors
///
/// `ConditionFailed` is the one recoverable kind; callers branch on it.
/// Everything else bubbles up unchanged - retry policy belongs to callers.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("condition failed")]
    ConditionFailed,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Conditions evaluated atomically with the write they guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The key must not refer to a live item.
    KeyNotExists,
    /// The key must refer to a live item.
    KeyExists,
    /// The named attribute must be absent or null on the current item.
    FieldAbsent(&'static str),
}

/// Which image an update returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnValues {
    #[default]
    None,
    /// The full post-image.
    AllNew,
    /// Only the attributes the update touched, post-image values.
    UpdatedNew,
}

/// An atomic update: either every assignment applies and every condition
/// holds, or nothing changes.
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub(crate) set: Vec<(String, Value)>,
    pub(crate) set_if_absent: Vec<(String, Value)>,
    pub(crate) add: Vec<(String, i64)>,
    pub(crate) conditions: Vec<Condition>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an attribute unconditionally.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((name.into(), value.into()));
        self
    }

    /// Assign an attribute only when the current item lacks it.
    pub fn set_if_absent(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_if_absent.push((name.into(), value.into()));
        self
    }

    /// Add to an integer counter attribute (absent counts as zero).
    pub fn add(mut self, name: impl Into<String>, delta: i64) -> Self {
        self.add.push((name.into(), delta));
        self
    }

    /// Guard the whole update with a condition.
    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Attribute names this update touches, in declaration order.
    pub(crate) fn touched(&self) -> Vec<String> {
        self.set
            .iter()
            .map(|(n, _)| n.clone())
            .chain(self.set_if_absent.iter().map(|(n, _)| n.clone()))
            .chain(self.add.iter().map(|(n, _)| n.clone()))
            .collect()
    }
}

/// Post-filter applied to query/scan results after key matching.
pub type Filter<'a> = &'a dyn Fn(&Item) -> bool;

/// Pluggable item store backend
///
/// Implementations must be thread-safe (`Send + Sync`). All operations are
/// synchronous from the caller's perspective.
pub trait ItemStore: Send + Sync {
    /// Point read. Returns `None` for missing or TTL-expired items.
    fn get(&self, key: &Key) -> Result<Option<Item>, StorageError>;

    /// Write an item, optionally guarded by a condition.
    fn put(&self, key: &Key, item: Item, condition: Option<Condition>)
        -> Result<(), StorageError>;

    /// Remove an item. Removing a missing item is not an error.
    fn delete(&self, key: &Key) -> Result<(), StorageError>;

    /// All live items in a partition, optionally post-filtered.
    fn query(&self, partition: &str, filter: Option<Filter>) -> Result<Vec<Item>, StorageError>;

    /// Full-keyspace iteration, all pages assembled, optionally post-filtered.
    fn scan(&self, filter: Option<Filter>) -> Result<Vec<Item>, StorageError>;

    /// Atomic conditional update. Either every assignment applies and every
    /// condition held, or nothing changes and `ConditionFailed` is returned.
    /// Creates the item when absent unless guarded by `KeyExists`.
    fn update(
        &self,
        key: &Key,
        update: Update,
        ret: ReturnValues,
    ) -> Result<Option<Item>, StorageError>;
}

/// True when the item carries a `ttl` attribute in the past.
pub(crate) fn is_expired(item: &Item, now: i64) -> bool {
    item.get(TTL_ATTR)
        .and_then(Value::as_i64)
        .is_some_and(|ttl| ttl <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sort_key_conversions() {
        assert_eq!(SortKey::from(603), SortKey::Int(603));
        assert_eq!(SortKey::from("plex://x"), SortKey::Str("plex://x".into()));
    }

    #[test]
    fn update_builder_collects_touched_names() {
        let u = Update::new()
            .set("last_attempt", 10)
            .set_if_absent("first_attempt", 10)
            .add("failed_attempts", 1);
        assert_eq!(
            u.touched(),
            vec!["last_attempt", "first_attempt", "failed_attempts"]
        );
    }

    #[test]
    fn expiry_checks_ttl_attribute() {
        let mut item = Item::new();
        assert!(!is_expired(&item, 100));
        item.insert(TTL_ATTR.into(), json!(99));
        assert!(is_expired(&item, 100));
        item.insert(TTL_ATTR.into(), json!(101));
        assert!(!is_expired(&item, 100));
    }
}
