//! In-process key-value store.

use super::{KeyValueStore, SetChange};
use crate::error::{KvError, KvResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Plain(String),
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`KeyValueStore`].
///
/// One lock guards the whole map, like a single-threaded KV server: every
/// operation, batch reads included, is atomic. Expired entries are invisible
/// to reads and removed lazily or by [`sweep_expired`](KeyValueStore::sweep_expired).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    /// Check if the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live entry for `key`, evicting it first if expired.
    fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> KvResult<()> {
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Plain(value),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Plain(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        let mut map = self.lock();
        Ok(Self::live(&mut map, key).is_some() && map.remove(key).is_some())
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> KvResult<SetChange> {
        let mut map = self.lock();
        if Self::live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        let entry = map
            .get_mut(key)
            .ok_or_else(|| KvError::Unavailable(key.to_string()))?;
        let Value::Set(set) = &mut entry.value else {
            return Err(KvError::WrongType(key.to_string()));
        };
        let changed = set.insert(member.to_string());
        let cardinality = set.len();
        entry.expires_at = deadline(ttl);
        Ok(SetChange {
            changed,
            cardinality,
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<SetChange> {
        let mut map = self.lock();
        let Some(entry) = Self::live(&mut map, key) else {
            return Ok(SetChange {
                changed: false,
                cardinality: 0,
            });
        };
        let Value::Set(set) = &mut entry.value else {
            return Err(KvError::WrongType(key.to_string()));
        };
        let changed = set.remove(member);
        let cardinality = set.len();
        if cardinality == 0 {
            map.remove(key);
        }
        Ok(SetChange {
            changed,
            cardinality,
        })
    }

    async fn members(&self, key: &str) -> KvResult<Vec<String>> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn cardinality(&self, key: &str) -> KvResult<usize> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(0),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.len()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn get_many(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        let mut map = self.lock();
        keys.iter()
            .map(|key| match Self::live(&mut map, key) {
                None => Ok(None),
                Some(Entry {
                    value: Value::Plain(v),
                    ..
                }) => Ok(Some(v.clone())),
                Some(_) => Err(KvError::WrongType(key.clone())),
            })
            .collect()
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sweep_expired(&self) -> KvResult<usize> {
        let now = Instant::now();
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired(now));
        Ok(before - map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(90);

    #[tokio::test]
    async fn plain_values_round_trip() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_add_reports_post_add_cardinality() {
        let store = MemoryStore::new();
        let first = store.set_add("s", "a", Some(TTL)).await.unwrap();
        assert_eq!(first, SetChange { changed: true, cardinality: 1 });

        let again = store.set_add("s", "a", Some(TTL)).await.unwrap();
        assert_eq!(again, SetChange { changed: false, cardinality: 1 });

        let second = store.set_add("s", "b", Some(TTL)).await.unwrap();
        assert_eq!(second, SetChange { changed: true, cardinality: 2 });
    }

    #[tokio::test]
    async fn set_remove_deletes_empty_sets() {
        let store = MemoryStore::new();
        store.set_add("s", "a", None).await.unwrap();
        store.set_add("s", "b", None).await.unwrap();

        let first = store.set_remove("s", "a").await.unwrap();
        assert_eq!(first, SetChange { changed: true, cardinality: 1 });
        let last = store.set_remove("s", "b").await.unwrap();
        assert_eq!(last, SetChange { changed: true, cardinality: 0 });
        let missing = store.set_remove("s", "b").await.unwrap();
        assert_eq!(missing, SetChange { changed: false, cardinality: 0 });
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), None).await.unwrap();
        assert_eq!(
            store.set_add("k", "m", None).await,
            Err(KvError::WrongType("k".into()))
        );
        assert!(store.members("k").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), Some(Duration::from_secs(5))).await.unwrap();
        store.set_add("s", "a", Some(Duration::from_secs(5))).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.cardinality("s").await.unwrap(), 0);
        // Re-adding to an expired set starts from empty.
        let change = store.set_add("s", "a", None).await.unwrap();
        assert_eq!(change, SetChange { changed: true, cardinality: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn expire_rearms_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), Some(Duration::from_secs(5))).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.expire("k", Duration::from_secs(5)).await.unwrap());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let store = MemoryStore::new();
        store.set("short", "1".into(), Some(Duration::from_secs(1))).await.unwrap();
        store.set("long", "2".into(), Some(Duration::from_secs(100))).await.unwrap();
        store.set("forever", "3".into(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn get_many_preserves_order_and_gaps() {
        let store = MemoryStore::new();
        store.set("a", "1".into(), None).await.unwrap();
        store.set("c", "3".into(), None).await.unwrap();

        let values = store
            .get_many(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".into()), None, Some("3".into())]);
    }
}
