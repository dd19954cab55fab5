//! Typed key → entry map with a reverse uuid index

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::keys::ObjKey;
use crate::locks::{safe_read, safe_write};

/// Anything stored in an [`ObjectCache`]
pub trait CacheEntry: Clone + Send + Sync {
    fn uuid(&self) -> Option<&str>;
}

#[derive(Debug)]
struct Maps<V> {
    by_key: BTreeMap<ObjKey, V>,
    by_uuid: HashMap<String, ObjKey>,
    /// Bumped on every single-key write
    generation: u64,
    /// Generation of the last single-key write per key, removals included
    written: HashMap<ObjKey, u64>,
}

impl<V> Maps<V> {
    fn touch(&mut self, key: &ObjKey) {
        self.generation += 1;
        self.written.insert(key.clone(), self.generation);
    }
}

/// One remote object type's mirror.
///
/// Both maps change under one write lock, so a uuid always resolves to a key
/// whose entry carries that uuid.
///
/// Single-key writes are stamped with a generation so a bulk snapshot taken
/// over several round trips can be applied without losing writes that landed
/// while it was being fetched.
#[derive(Debug)]
pub struct ObjectCache<V> {
    maps: RwLock<Maps<V>>,
}

impl<V: CacheEntry> Default for ObjectCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: CacheEntry> ObjectCache<V> {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps {
                by_key: BTreeMap::new(),
                by_uuid: HashMap::new(),
                generation: 0,
                written: HashMap::new(),
            }),
        }
    }

    pub fn get(&self, key: &ObjKey) -> Option<V> {
        safe_read(&self.maps).by_key.get(key).cloned()
    }

    pub fn get_key_by_uuid(&self, uuid: &str) -> Option<ObjKey> {
        safe_read(&self.maps).by_uuid.get(uuid).cloned()
    }

    pub fn contains(&self, key: &ObjKey) -> bool {
        safe_read(&self.maps).by_key.contains_key(key)
    }

    /// Insert or replace, keeping the uuid index in step
    pub fn upsert(&self, key: ObjKey, entry: V) {
        let mut maps = safe_write(&self.maps);
        maps.touch(&key);
        Self::insert_locked(&mut maps, key, entry);
    }

    pub fn remove(&self, key: &ObjKey) -> Option<V> {
        let mut maps = safe_write(&self.maps);
        maps.touch(key);
        let removed = maps.by_key.remove(key)?;
        if let Some(uuid) = removed.uuid() {
            if maps.by_uuid.get(uuid) == Some(key) {
                maps.by_uuid.remove(uuid);
            }
        }
        Some(removed)
    }

    /// Read-modify-write one entry under the write lock.
    ///
    /// `f` receives `None` when the key is absent; returning `None` removes
    /// the entry.
    pub fn update<F>(&self, key: &ObjKey, f: F)
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let mut maps = safe_write(&self.maps);
        maps.touch(key);
        let current = maps.by_key.remove(key);
        if let Some(uuid) = current.as_ref().and_then(|c| c.uuid()) {
            if maps.by_uuid.get(uuid) == Some(key) {
                maps.by_uuid.remove(uuid);
            }
        }
        if let Some(next) = f(current) {
            Self::insert_locked(&mut maps, key.clone(), next);
        }
    }

    pub fn keys(&self) -> Vec<ObjKey> {
        safe_read(&self.maps).by_key.keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(ObjKey, V)> {
        safe_read(&self.maps)
            .by_key
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        safe_read(&self.maps).by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current write generation, taken before fetching a bulk snapshot
    pub fn generation(&self) -> u64 {
        safe_read(&self.maps).generation
    }

    /// Swap the whole contents, returning the previous entries
    pub fn replace_all(&self, entries: BTreeMap<ObjKey, V>) -> BTreeMap<ObjKey, V> {
        let since = self.generation();
        self.replace_since(entries, since)
    }

    /// Swap in a snapshot fetched after generation `since`.
    ///
    /// Keys written since then keep their current state, present or removed;
    /// every other key takes the snapshot's. Returns the previous entries.
    pub fn replace_since(&self, entries: BTreeMap<ObjKey, V>, since: u64) -> BTreeMap<ObjKey, V> {
        let mut maps = safe_write(&self.maps);
        let newer: BTreeMap<ObjKey, Option<V>> = maps
            .written
            .iter()
            .filter(|(_, generation)| **generation > since)
            .map(|(key, _)| (key.clone(), maps.by_key.get(key).cloned()))
            .collect();

        let previous = std::mem::take(&mut maps.by_key);
        maps.by_uuid.clear();
        for (key, entry) in entries {
            if !newer.contains_key(&key) {
                Self::insert_locked(&mut maps, key, entry);
            }
        }
        for (key, entry) in newer {
            if let Some(entry) = entry {
                Self::insert_locked(&mut maps, key, entry);
            }
        }
        maps.written.retain(|_, generation| *generation > since);
        previous
    }

    fn insert_locked(maps: &mut Maps<V>, key: ObjKey, entry: V) {
        if let Some(old_uuid) = maps.by_key.get(&key).and_then(|e| e.uuid()).map(str::to_string) {
            maps.by_uuid.remove(&old_uuid);
        }
        if let Some(uuid) = entry.uuid() {
            maps.by_uuid.insert(uuid.to_string(), key.clone());
        }
        maps.by_key.insert(key, entry);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry(Option<String>);

    impl CacheEntry for Entry {
        fn uuid(&self) -> Option<&str> {
            self.0.as_deref()
        }
    }

    fn key(name: &str) -> ObjKey {
        ObjKey::new("admin", name)
    }

    #[test]
    fn test_uuid_index_follows_upserts() {
        let cache = ObjectCache::new();
        cache.upsert(key("a"), Entry(Some("u1".into())));
        assert_eq!(cache.get_key_by_uuid("u1"), Some(key("a")));

        cache.upsert(key("a"), Entry(Some("u2".into())));
        assert_eq!(cache.get_key_by_uuid("u1"), None, "stale uuid dropped");
        assert_eq!(cache.get_key_by_uuid("u2"), Some(key("a")));

        cache.remove(&key("a"));
        assert_eq!(cache.get_key_by_uuid("u2"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_update_can_insert_modify_and_remove() {
        let cache: ObjectCache<Entry> = ObjectCache::new();
        cache.update(&key("a"), |current| {
            assert!(current.is_none());
            Some(Entry(Some("u1".into())))
        });
        assert_eq!(cache.get(&key("a")), Some(Entry(Some("u1".into()))));

        cache.update(&key("a"), |_| None);
        assert!(!cache.contains(&key("a")));
        assert_eq!(cache.get_key_by_uuid("u1"), None);
    }

    #[test]
    fn test_replace_all_rebuilds_index() {
        let cache = ObjectCache::new();
        cache.upsert(key("old"), Entry(Some("u-old".into())));

        let previous = cache.replace_all(BTreeMap::from([(key("new"), Entry(Some("u-new".into())))]));
        assert!(previous.contains_key(&key("old")));
        assert_eq!(cache.get_key_by_uuid("u-old"), None);
        assert_eq!(cache.get_key_by_uuid("u-new"), Some(key("new")));
        assert_eq!(cache.keys(), vec![key("new")]);
    }

    #[test]
    fn test_replace_since_keeps_newer_writes() {
        let cache = ObjectCache::new();
        cache.upsert(key("kept"), Entry(Some("u-kept".into())));
        cache.upsert(key("gone"), Entry(Some("u-gone".into())));
        let since = cache.generation();

        // written while the snapshot was in flight
        cache.upsert(key("created"), Entry(Some("u-created".into())));
        cache.remove(&key("gone"));

        cache.replace_since(
            BTreeMap::from([
                (key("kept"), Entry(Some("u-kept-2".into()))),
                (key("gone"), Entry(Some("u-gone".into()))),
            ]),
            since,
        );
        assert_eq!(cache.get(&key("kept")), Some(Entry(Some("u-kept-2".into()))));
        assert_eq!(cache.get(&key("created")), Some(Entry(Some("u-created".into()))));
        assert!(!cache.contains(&key("gone")), "removal is not undone by the snapshot");
        assert_eq!(cache.get_key_by_uuid("u-gone"), None);

        // the next snapshot is authoritative again
        cache.replace_all(BTreeMap::new());
        assert!(cache.is_empty());
    }
}
