use crate::error::{KvError, KvResult};
use std::collections::BTreeMap;
use std::fmt;

const HASH_SEED: u64 = 1125899906842597;

/// Places a key on the slave ring. A 64-bit variant of the classic
/// `31 * h + c` string hash over UTF-16 code units; not cryptographic.
pub fn hash_to_64(key: &str) -> u64 {
    key.encode_utf16()
        .fold(HASH_SEED, |h, c| h.wrapping_mul(31).wrapping_add(u64::from(c)))
}

/// A registered slave. `id` is its position on the ring; negative ids given
/// at registration are kept in two's-complement form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlaveInfo {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

impl SlaveInfo {
    pub fn new(id: u64, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// Parses `"<id>@<host>:<port>"`. The id ends at the first `@` and the
    /// host runs up to the last `:`.
    pub fn parse(info: &str) -> KvResult<Self> {
        let unparseable = || KvError::Registration("could not parse the slave info".into());

        let (id, rest) = info.split_once('@').ok_or_else(unparseable)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(unparseable)?;
        let digits = id.strip_prefix('-').unwrap_or(id);
        if !is_decimal(digits) || host.is_empty() || !is_decimal(port) {
            return Err(unparseable());
        }

        let unrecognized = || KvError::Registration("could not recognize the slave info".into());
        let id: i64 = id.parse().map_err(|_| unrecognized())?;
        let port: u16 = port.parse().map_err(|_| unrecognized())?;
        Ok(Self::new(id as u64, host, port))
    }

    // id as it was written at registration
    pub fn signed_id(&self) -> i64 {
        self.id as i64
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// same textual form that was registered
impl fmt::Display for SlaveInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.signed_id(), self.host, self.port)
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// The ring of registered slaves, ordered by unsigned id.
#[derive(Debug)]
pub struct Registry {
    expected: usize,
    slaves: BTreeMap<u64, SlaveInfo>,
}

impl Registry {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            slaves: BTreeMap::new(),
        }
    }

    /// Adds a slave. A slave already on the ring may re-register to update its
    /// address; a new id is refused once the ring is full.
    pub fn register(&mut self, info: SlaveInfo) -> KvResult<()> {
        if !self.slaves.contains_key(&info.id) && self.slaves.len() >= self.expected {
            return Err(KvError::Registration(
                "master already has enough slave servers".into(),
            ));
        }
        self.slaves.insert(info.id, info);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.slaves.len() == self.expected
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&SlaveInfo> {
        self.slaves.get(&id)
    }

    /// First slave with id >= hash(key), wrapping to the lowest id.
    pub fn find_primary(&self, key: &str) -> Option<&SlaveInfo> {
        let hashed = hash_to_64(key);
        self.slaves
            .range(hashed..)
            .next()
            .or_else(|| self.slaves.iter().next())
            .map(|(_, info)| info)
    }

    /// First slave with id > `id`, wrapping to the lowest id.
    pub fn find_successor(&self, id: u64) -> Option<&SlaveInfo> {
        let after = id.checked_add(1).and_then(|next| self.slaves.range(next..).next());
        after
            .or_else(|| self.slaves.iter().next())
            .map(|(_, info)| info)
    }

    /// Primary and secondary replica for a key.
    pub fn replicas(&self, key: &str) -> Option<(SlaveInfo, SlaveInfo)> {
        let primary = self.find_primary(key)?;
        let secondary = self.find_successor(primary.id)?;
        Some((primary.clone(), secondary.clone()))
    }
}
