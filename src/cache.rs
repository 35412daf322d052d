use crate::error::{KvError, KvResult};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::{hash_map::DefaultHasher, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub referenced: bool,
}

impl CacheEntry {
    fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            referenced: false,
        }
    }
}

/// One set of the cache: a FIFO of at most `capacity` entries with a
/// reference bit each, evicted with the second-chance (CLOCK) policy.
///
/// Not synchronized on its own; reach it through [`KvCache::write_lock`].
#[derive(Debug)]
pub struct CacheSet {
    entries: VecDeque<CacheEntry>,
    capacity: usize,
}

impl CacheSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Looks the key up and marks the entry as referenced on a hit.
    pub fn get(&mut self, key: &str) -> Option<String> {
        let entry = self.entries.iter_mut().find(|e| e.key == key)?;
        entry.referenced = true;
        Some(entry.value.clone())
    }

    /// Overwrites in place when present (reference bit untouched), otherwise
    /// inserts, evicting if the set is full.
    pub fn put(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.value = value.to_string();
            return;
        }
        self.insert(key, value);
    }

    /// Fills the set after a read from the backing store. Always inserts a
    /// fresh, unreferenced entry at the tail.
    pub fn replace(&mut self, key: &str, value: &str) {
        self.del(key);
        self.insert(key, value);
    }

    pub fn del(&mut self, key: &str) {
        if let Some(idx) = self.entries.iter().position(|e| e.key == key) {
            self.entries.remove(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    fn insert(&mut self, key: &str, value: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        self.entries.push_back(CacheEntry::new(key, value));
    }

    // Every entry passed over loses its bit, so this ends within two laps.
    fn evict(&mut self) {
        while let Some(mut head) = self.entries.pop_front() {
            if !head.referenced {
                return;
            }
            head.referenced = false;
            self.entries.push_back(head);
        }
    }
}

/// Set-associative cache: `num_sets` independently locked [`CacheSet`]s.
#[derive(Clone)]
pub struct KvCache {
    sets: Vec<Arc<RwLock<CacheSet>>>,
    num_sets: usize,
    max_elems_per_set: usize,
}

impl KvCache {
    pub fn new(num_sets: usize, max_elems_per_set: usize) -> Self {
        let num_sets = num_sets.max(1);
        let sets = (0..num_sets)
            .map(|_| Arc::new(RwLock::new(CacheSet::new(max_elems_per_set))))
            .collect();
        Self {
            sets,
            num_sets,
            max_elems_per_set,
        }
    }

    // set index for a key is the same for the lifetime of the cache
    pub fn set_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.num_sets
    }

    /// Exclusive access to the set holding `key`. Reads take this too, since
    /// a hit flips the reference bit.
    pub async fn write_lock(&self, key: &str) -> OwnedRwLockWriteGuard<CacheSet> {
        self.sets[self.set_index(key)].clone().write_owned().await
    }

    /// Renders every set, padding each with invalid placeholder entries up to
    /// its capacity.
    pub async fn to_xml(&self) -> KvResult<String> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(dump_error)?;
        writer
            .write_event(Event::Start(BytesStart::new("KVCache")))
            .map_err(dump_error)?;

        for (idx, set) in self.sets.iter().enumerate() {
            let set = set.read().await;
            let id = idx.to_string();
            writer
                .write_event(Event::Start(
                    BytesStart::new("Set").with_attributes([("Id", id.as_str())]),
                ))
                .map_err(dump_error)?;
            for entry in set.entries() {
                write_entry(&mut writer, Some(entry))?;
            }
            for _ in set.len()..self.max_elems_per_set {
                write_entry(&mut writer, None)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("Set")))
                .map_err(dump_error)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("KVCache")))
            .map_err(dump_error)?;
        String::from_utf8(writer.into_inner())
            .map_err(|_| KvError::Unknown("cache dump is not UTF-8".into()))
    }
}

fn write_entry(writer: &mut Writer<Vec<u8>>, entry: Option<&CacheEntry>) -> KvResult<()> {
    let referenced = entry.map_or(false, |e| e.referenced).to_string();
    let valid = entry.is_some().to_string();
    let start = BytesStart::new("CacheEntry").with_attributes([
        ("isReferenced", referenced.as_str()),
        ("isValid", valid.as_str()),
    ]);
    writer.write_event(Event::Start(start)).map_err(dump_error)?;
    for name in ["Key", "Value"] {
        let text = match (entry, name) {
            (Some(e), "Key") => Some(e.key.as_str()),
            (Some(e), _) => Some(e.value.as_str()),
            (None, _) => None,
        };
        match text {
            Some(text) => {
                writer
                    .write_event(Event::Start(BytesStart::new(name)))
                    .map_err(dump_error)?;
                writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .map_err(dump_error)?;
                writer
                    .write_event(Event::End(BytesEnd::new(name)))
                    .map_err(dump_error)?;
            }
            None => {
                writer
                    .write_event(Event::Empty(BytesStart::new(name)))
                    .map_err(dump_error)?;
            }
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new("CacheEntry")))
        .map_err(dump_error)
}

fn dump_error(e: quick_xml::Error) -> KvError {
    KvError::Unknown(format!("could not dump cache: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(set: &CacheSet) -> Vec<&str> {
        set.entries().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn test_get_sets_reference_bit_only_on_hit() {
        let mut set = CacheSet::new(2);
        set.put("a", "1");
        assert_eq!(set.get("missing"), None);
        assert!(!set.entries().next().unwrap().referenced);
        assert_eq!(set.get("a").as_deref(), Some("1"));
        assert!(set.entries().next().unwrap().referenced);
    }

    #[test]
    fn test_put_overwrites_in_place() {
        let mut set = CacheSet::new(2);
        set.put("a", "1");
        set.put("b", "2");
        set.get("a");
        set.put("a", "3");
        assert_eq!(keys(&set), vec!["a", "b"]);
        let a = set.entries().next().unwrap();
        assert_eq!(a.value, "3");
        assert!(a.referenced);
    }

    #[test]
    fn test_unreferenced_entries_leave_in_fifo_order() {
        let mut set = CacheSet::new(3);
        for k in ["k1", "k2", "k3", "k4"] {
            set.put(k, "v");
        }
        assert!(!set.contains("k1"));
        assert_eq!(keys(&set), vec!["k2", "k3", "k4"]);
    }

    #[test]
    fn test_referenced_entry_gets_a_second_chance() {
        let mut set = CacheSet::new(3);
        for k in ["k1", "k2", "k3"] {
            set.put(k, "v");
        }
        set.get("k1");
        set.put("k4", "v");

        assert!(set.contains("k1"));
        assert!(!set.contains("k2"));
        assert_eq!(keys(&set), vec!["k3", "k1", "k4"]);
        // the bit was spent on the pass
        assert!(set.entries().all(|e| !e.referenced));
    }

    #[test]
    fn test_all_referenced_evicts_oldest_after_one_lap() {
        let mut set = CacheSet::new(2);
        set.put("a", "1");
        set.put("b", "2");
        set.get("a");
        set.get("b");
        set.put("c", "3");
        assert_eq!(keys(&set), vec!["b", "c"]);
    }

    #[test]
    fn test_replace_never_duplicates_a_key() {
        let mut set = CacheSet::new(2);
        set.put("a", "1");
        set.put("b", "2");
        set.get("a");
        set.replace("a", "fresh");
        assert_eq!(keys(&set), vec!["b", "a"]);
        assert_eq!(set.len(), 2);
        let a = set.entries().last().unwrap();
        assert_eq!(a.value, "fresh");
        assert!(!a.referenced);
    }

    #[test]
    fn test_replace_on_full_set_goes_through_eviction() {
        let mut set = CacheSet::new(2);
        set.put("a", "1");
        set.put("b", "2");
        set.replace("c", "3");
        assert_eq!(keys(&set), vec!["b", "c"]);
    }

    #[test]
    fn test_del_is_a_noop_for_missing_keys() {
        let mut set = CacheSet::new(2);
        set.put("a", "1");
        set.del("zzz");
        assert_eq!(set.len(), 1);
        set.del("a");
        assert!(set.is_empty());
    }

    #[test]
    fn test_zero_capacity_holds_nothing() {
        let mut set = CacheSet::new(0);
        set.put("a", "1");
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_key_always_maps_to_same_set() {
        let cache = KvCache::new(16, 4);
        let idx = cache.set_index("some key");
        for _ in 0..10 {
            assert_eq!(cache.set_index("some key"), idx);
        }
        {
            let mut set = cache.write_lock("some key").await;
            set.put("some key", "v");
        }
        let mut set = cache.write_lock("some key").await;
        assert_eq!(set.get("some key").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_xml_dump_pads_sets_to_capacity() {
        let cache = KvCache::new(2, 3);
        cache.write_lock("k").await.put("k", "v");
        let xml = cache.to_xml().await.unwrap();
        assert_eq!(xml.matches("<CacheEntry").count(), 6);
        assert_eq!(xml.matches(r#"isValid="true""#).count(), 1);
        assert!(xml.contains("<Key>k</Key><Value>v</Value>"));
        assert!(xml.contains(r#"<Set Id="0">"#));
    }
}
