use crate::error::{KvError, KvResult};
use crate::messages::check_key_value;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::{hash_map::DefaultHasher, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The raw key/value map behind each slave, split into independently locked
/// stripes.
#[derive(Clone)]
pub struct KvStore {
    stripes: Vec<Arc<Mutex<HashMap<String, String>>>>,
    num_stripes: usize,
}

impl KvStore {
    pub fn new(num_stripes: usize) -> Self {
        let num_stripes = num_stripes.max(1);
        let stripes = (0..num_stripes)
            .map(|_| Arc::new(Mutex::new(HashMap::new())))
            .collect();
        Self {
            stripes,
            num_stripes,
        }
    }

    fn stripe_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.num_stripes
    }

    pub async fn get(&self, key: &str) -> KvResult<String> {
        let guard = self.stripes[self.stripe_index(key)].lock().await;
        guard.get(key).cloned().ok_or(KvError::NotFound)
    }

    // Stores/replaces the value
    pub async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        check_key_value(key, value)?;
        let mut guard = self.stripes[self.stripe_index(key)].lock().await;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub async fn del(&self, key: &str) -> KvResult<()> {
        let mut guard = self.stripes[self.stripe_index(key)].lock().await;
        guard.remove(key).map(|_| ()).ok_or(KvError::NotFound)
    }

    pub async fn contains(&self, key: &str) -> bool {
        let guard = self.stripes[self.stripe_index(key)].lock().await;
        guard.contains_key(key)
    }

    /// Snapshot of every pair, sorted by key.
    pub async fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for stripe in &self.stripes {
            let guard = stripe.lock().await;
            pairs.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        pairs.sort();
        pairs
    }

    /// Renders the store as `<KVStore><KVPair><Key/><Value/></KVPair>...`.
    pub async fn to_xml(&self) -> KvResult<String> {
        let pairs = self.pairs().await;
        let mut writer = Writer::new(Vec::new());
        let result: quick_xml::Result<()> = (|| {
            writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
            writer.write_event(Event::Start(BytesStart::new("KVStore")))?;
            for (key, value) in &pairs {
                writer.write_event(Event::Start(BytesStart::new("KVPair")))?;
                for (name, text) in [("Key", key), ("Value", value)] {
                    writer.write_event(Event::Start(BytesStart::new(name)))?;
                    writer.write_event(Event::Text(BytesText::new(text)))?;
                    writer.write_event(Event::End(BytesEnd::new(name)))?;
                }
                writer.write_event(Event::End(BytesEnd::new("KVPair")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("KVStore")))?;
            Ok(())
        })();
        result.map_err(|e| KvError::Unknown(format!("could not dump store: {e}")))?;
        String::from_utf8(writer.into_inner())
            .map_err(|_| KvError::Unknown("store dump is not UTF-8".into()))
    }
}
