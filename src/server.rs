use crate::cache::KvCache;
use crate::db::KvStore;
use crate::error::KvResult;
use crate::messages::{check_key, check_key_value};

const STORE_STRIPES: usize = 16;

/// A slave's local storage: a [`KvCache`] in front of a [`KvStore`].
///
/// Every operation holds the key's cache set for its whole duration, so the
/// cache and the store never disagree about a key.
#[derive(Clone)]
pub struct KvServer {
    cache: KvCache,
    store: KvStore,
}

impl KvServer {
    pub fn new(cache_sets: usize, cache_set_size: usize) -> Self {
        Self {
            cache: KvCache::new(cache_sets, cache_set_size),
            store: KvStore::new(STORE_STRIPES),
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        check_key_value(key, value)?;
        let mut set = self.cache.write_lock(key).await;
        self.store.put(key, value).await?;
        set.put(key, value);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> KvResult<String> {
        check_key(key)?;
        let mut set = self.cache.write_lock(key).await;
        if let Some(value) = set.get(key) {
            return Ok(value);
        }
        let value = self.store.get(key).await?;
        set.replace(key, &value);
        Ok(value)
    }

    pub async fn del(&self, key: &str) -> KvResult<()> {
        check_key(key)?;
        let mut set = self.cache.write_lock(key).await;
        set.del(key);
        self.store.del(key).await
    }

    // only the store is authoritative
    pub async fn has_key(&self, key: &str) -> bool {
        self.store.contains(key).await
    }

    pub async fn dump_store(&self) -> KvResult<String> {
        self.store.to_xml().await
    }

    pub async fn dump_cache(&self) -> KvResult<String> {
        self.cache.to_xml().await
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &KvCache {
        &self.cache
    }
}
