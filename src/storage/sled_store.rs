//! Sled-backed item store
//!
//! Composite keys are encoded order-preserving as
//! `partition || 0x00 || tag || sort-bytes`; values are JSON-serialized
//! attribute maps. Atomic conditional updates run as a compare-and-swap
//! loop on the raw value bytes.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::{
    is_expired, Condition, Filter, Item, ItemStore, Key, ReturnValues, SortKey, StorageError,
    Update,
};

/// Separator between partition and sort bytes. Partition names never
/// contain NUL.
const KEY_SEP: u8 = 0x00;
const TAG_INT: u8 = 0x01;
const TAG_STR: u8 = 0x02;

/// Embedded sled backend.
#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
}

impl SledStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open a throwaway in-memory store (tests).
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StorageError::from)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn encode_key(key: &Key) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.partition.len() + 16);
        out.extend_from_slice(key.partition.as_bytes());
        out.push(KEY_SEP);
        match &key.sort {
            // Sign-flip so negative sorts order below positive ones.
            SortKey::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
            }
            SortKey::Str(s) => {
                out.push(TAG_STR);
                out.extend_from_slice(s.as_bytes());
            }
        }
        out
    }

    fn partition_prefix(partition: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(partition.len() + 1);
        out.extend_from_slice(partition.as_bytes());
        out.push(KEY_SEP);
        out
    }

    fn decode_item(bytes: &[u8]) -> Result<Item, StorageError> {
        serde_json::from_slice(bytes).map_err(StorageError::from)
    }

    /// Best-effort removal of an expired item; losing the race is fine.
    fn reclaim(&self, key_bytes: &[u8], stale: &sled::IVec) {
        let _ = self
            .db
            .compare_and_swap(key_bytes, Some(stale.clone()), None::<sled::IVec>);
    }

    fn check_conditions(
        conditions: &[Condition],
        current: Option<&Item>,
    ) -> Result<(), StorageError> {
        for condition in conditions {
            let holds = match condition {
                Condition::KeyNotExists => current.is_none(),
                Condition::KeyExists => current.is_some(),
                // Absent item has no attributes, so the condition holds.
                Condition::FieldAbsent(field) => current
                    .map(|item| matches!(item.get(*field), None | Some(Value::Null)))
                    .unwrap_or(true),
            };
            if !holds {
                return Err(StorageError::ConditionFailed);
            }
        }
        Ok(())
    }

    fn apply_update(current: Option<&Item>, update: &Update) -> Item {
        let mut item = current.cloned().unwrap_or_default();
        for (name, value) in &update.set {
            item.insert(name.clone(), value.clone());
        }
        for (name, value) in &update.set_if_absent {
            if matches!(item.get(name), None | Some(Value::Null)) {
                item.insert(name.clone(), value.clone());
            }
        }
        for (name, delta) in &update.add {
            let base = item.get(name).and_then(Value::as_i64).unwrap_or(0);
            item.insert(name.clone(), Value::from(base + delta));
        }
        item
    }

    fn collect(
        &self,
        iter: impl Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
        filter: Option<Filter>,
    ) -> Result<Vec<Item>, StorageError> {
        let now = Utc::now().timestamp();
        let mut items = Vec::new();
        for entry in iter {
            let (key_bytes, value_bytes) = entry?;
            let item = Self::decode_item(&value_bytes)?;
            if is_expired(&item, now) {
                self.reclaim(&key_bytes, &value_bytes);
                continue;
            }
            if filter.map(|f| f(&item)).unwrap_or(true) {
                items.push(item);
            }
        }
        Ok(items)
    }
}

impl ItemStore for SledStore {
    fn get(&self, key: &Key) -> Result<Option<Item>, StorageError> {
        let key_bytes = Self::encode_key(key);
        match self.db.get(&key_bytes)? {
            None => Ok(None),
            Some(value_bytes) => {
                let item = Self::decode_item(&value_bytes)?;
                if is_expired(&item, Utc::now().timestamp()) {
                    self.reclaim(&key_bytes, &value_bytes);
                    return Ok(None);
                }
                Ok(Some(item))
            }
        }
    }

    fn put(
        &self,
        key: &Key,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), StorageError> {
        let key_bytes = Self::encode_key(key);
        let value_bytes = serde_json::to_vec(&item)?;
        let conditions: Vec<Condition> = condition.into_iter().collect();
        loop {
            let current_bytes = self.db.get(&key_bytes)?;
            let current = match &current_bytes {
                Some(bytes) => {
                    let existing = Self::decode_item(bytes)?;
                    (!is_expired(&existing, Utc::now().timestamp())).then_some(existing)
                }
                None => None,
            };
            Self::check_conditions(&conditions, current.as_ref())?;
            match self.db.compare_and_swap(
                &key_bytes,
                current_bytes,
                Some(value_bytes.clone()),
            )? {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    fn delete(&self, key: &Key) -> Result<(), StorageError> {
        self.db.remove(Self::encode_key(key))?;
        Ok(())
    }

    fn query(&self, partition: &str, filter: Option<Filter>) -> Result<Vec<Item>, StorageError> {
        self.collect(self.db.scan_prefix(Self::partition_prefix(partition)), filter)
    }

    fn scan(&self, filter: Option<Filter>) -> Result<Vec<Item>, StorageError> {
        self.collect(self.db.iter(), filter)
    }

    fn update(
        &self,
        key: &Key,
        update: Update,
        ret: ReturnValues,
    ) -> Result<Option<Item>, StorageError> {
        let key_bytes = Self::encode_key(key);
        loop {
            let current_bytes = self.db.get(&key_bytes)?;
            let current = match &current_bytes {
                Some(bytes) => {
                    let existing = Self::decode_item(bytes)?;
                    (!is_expired(&existing, Utc::now().timestamp())).then_some(existing)
                }
                None => None,
            };
            Self::check_conditions(&update.conditions, current.as_ref())?;
            let new_item = Self::apply_update(current.as_ref(), &update);
            let new_bytes = serde_json::to_vec(&new_item)?;
            match self
                .db
                .compare_and_swap(&key_bytes, current_bytes, Some(new_bytes))?
            {
                Ok(()) => {
                    return Ok(match ret {
                        ReturnValues::None => None,
                        ReturnValues::AllNew => Some(new_item),
                        ReturnValues::UpdatedNew => {
                            let mut subset = Item::new();
                            for name in update.touched() {
                                if let Some(value) = new_item.get(&name) {
                                    subset.insert(name, value.clone());
                                }
                            }
                            Some(subset)
                        }
                    });
                }
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SledStore {
        SledStore::temporary().unwrap()
    }

    fn item(pairs: &[(&str, Value)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn round_trips_all_value_kinds() {
        let s = store();
        let key = Key::new("movie", 603);
        let original = item(&[
            ("flag", json!(true)),
            ("title", json!("The Matrix")),
            ("tmdb_id", json!(603)),
            ("rating", json!(8.7)),
            ("missing", json!(null)),
            ("keys", json!({"p256dh": "abc", "auth": "def"})),
            ("tags", json!(["a", "b", ["nested", 1]])),
        ]);
        s.put(&key, original.clone(), None).unwrap();
        let read = s.get(&key).unwrap().unwrap();
        assert_eq!(read, original);
        // int stays int, float stays float
        assert!(read["tmdb_id"].is_i64());
        assert!(read["rating"].is_f64());
    }

    #[test]
    fn conditional_put_rejects_existing() {
        let s = store();
        let key = Key::new("movie", 603);
        s.put(&key, item(&[("title", json!("x"))]), Some(Condition::KeyNotExists))
            .unwrap();
        let err = s
            .put(&key, item(&[("title", json!("y"))]), Some(Condition::KeyNotExists))
            .unwrap_err();
        assert!(matches!(err, StorageError::ConditionFailed));
        assert_eq!(s.get(&key).unwrap().unwrap()["title"], json!("x"));
    }

    #[test]
    fn query_is_partition_scoped() {
        let s = store();
        s.put(&Key::new("movie", 1), item(&[("t", json!("a"))]), None)
            .unwrap();
        s.put(&Key::new("movie", 2), item(&[("t", json!("b"))]), None)
            .unwrap();
        s.put(&Key::new("tv", 1), item(&[("t", json!("c"))]), None)
            .unwrap();
        assert_eq!(s.query("movie", None).unwrap().len(), 2);
        assert_eq!(s.query("tv", None).unwrap().len(), 1);
        assert_eq!(s.query("LIB#movie", None).unwrap().len(), 0);
    }

    #[test]
    fn query_applies_post_filter() {
        let s = store();
        s.put(&Key::new("tv", 1), item(&[("tvdb_id", json!(111))]), None)
            .unwrap();
        s.put(&Key::new("tv", 2), item(&[("tvdb_id", json!(222))]), None)
            .unwrap();
        let hits = s
            .query("tv", Some(&|i: &Item| i.get("tvdb_id") == Some(&json!(111))))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn update_guards_on_field_absent() {
        let s = store();
        let key = Key::new("tv", 100);
        s.put(&key, item(&[("title", json!("Show"))]), None).unwrap();

        let first = s
            .update(
                &key,
                Update::new()
                    .set("added_at", "2026-01-01T00:00:00Z")
                    .when(Condition::KeyExists)
                    .when(Condition::FieldAbsent("added_at")),
                ReturnValues::AllNew,
            )
            .unwrap()
            .unwrap();
        assert_eq!(first["added_at"], json!("2026-01-01T00:00:00Z"));

        let replay = s.update(
            &key,
            Update::new()
                .set("added_at", "2026-02-02T00:00:00Z")
                .when(Condition::KeyExists)
                .when(Condition::FieldAbsent("added_at")),
            ReturnValues::AllNew,
        );
        assert!(matches!(replay, Err(StorageError::ConditionFailed)));
        // first write survives
        assert_eq!(
            s.get(&key).unwrap().unwrap()["added_at"],
            json!("2026-01-01T00:00:00Z")
        );
    }

    #[test]
    fn update_with_key_exists_does_not_create() {
        let s = store();
        let key = Key::new("tv", 42);
        let err = s
            .update(
                &key,
                Update::new().set("added_at", "now").when(Condition::KeyExists),
                ReturnValues::None,
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::ConditionFailed));
        assert!(s.get(&key).unwrap().is_none());
    }

    #[test]
    fn counter_add_is_atomic_across_threads() {
        let s = store();
        let key = Key::new("RATELIMIT#1.2.3.4", 0);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            let key = key.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    s.update(
                        &key,
                        Update::new()
                            .add("failed_attempts", 1)
                            .set_if_absent("first_attempt", 1000),
                        ReturnValues::None,
                    )
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let bucket = s.get(&key).unwrap().unwrap();
        assert_eq!(bucket["failed_attempts"], json!(200));
        assert_eq!(bucket["first_attempt"], json!(1000));
    }

    #[test]
    fn updated_new_returns_touched_subset() {
        let s = store();
        let key = Key::new("RATELIMIT#ip", 0);
        s.put(&key, item(&[("other", json!("keep"))]), None).unwrap();
        let updated = s
            .update(
                &key,
                Update::new().add("failed_attempts", 1),
                ReturnValues::UpdatedNew,
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated["failed_attempts"], json!(1));
    }

    #[test]
    fn expired_items_are_invisible() {
        let s = store();
        let key = Key::new("RATELIMIT#ip", 0);
        let past = Utc::now().timestamp() - 10;
        s.put(&key, item(&[("failed_attempts", json!(5)), ("ttl", json!(past))]), None)
            .unwrap();
        assert!(s.get(&key).unwrap().is_none());
        assert!(s.query("RATELIMIT#ip", None).unwrap().is_empty());
        // a fresh conditional put sees the slot as free
        s.put(
            &key,
            item(&[("failed_attempts", json!(1))]),
            Some(Condition::KeyNotExists),
        )
        .unwrap();
        assert_eq!(s.get(&key).unwrap().unwrap()["failed_attempts"], json!(1));
    }

    #[test]
    fn reopen_preserves_items() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = SledStore::open(dir.path()).unwrap();
            s.put(
                &Key::new("movie", 603),
                item(&[("title", json!("The Matrix"))]),
                None,
            )
            .unwrap();
            s.flush().unwrap();
        }
        let s = SledStore::open(dir.path()).unwrap();
        assert_eq!(
            s.get(&Key::new("movie", 603)).unwrap().unwrap()["title"],
            json!("The Matrix")
        );
    }

    #[test]
    fn scan_sees_all_partitions() {
        let s = store();
        s.put(&Key::new("movie", 1), item(&[("plex_guid", json!("g1"))]), None)
            .unwrap();
        s.put(&Key::new("tv", 2), item(&[("plex_guid", json!("g2"))]), None)
            .unwrap();
        let all = s.scan(None).unwrap();
        assert_eq!(all.len(), 2);
        let hits = s
            .scan(Some(&|i: &Item| i.get("plex_guid") == Some(&json!("g2"))))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
