use crate::cache::KvCache;
use crate::error::{KvError, KvResult};
use crate::messages::{check_key, KvMessage, OpId};
use crate::net::exchange;
use crate::registry::{Registry, SlaveInfo};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const REGISTRATION_INCOMPLETE: &str = "the master server has not finished registration yet";

#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub expected_slaves: usize,
    // per exchange with a slave, in both phases
    pub vote_timeout: Duration,
    // pause between phase-2 attempts
    pub decision_backoff: Duration,
    pub cache_sets: usize,
    pub cache_set_size: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            expected_slaves: 2,
            vote_timeout: Duration::from_millis(5000),
            decision_backoff: Duration::from_millis(100),
            cache_sets: 100,
            cache_set_size: 10,
        }
    }
}

/// The 2PC coordinator. Every key lives on two slaves, the primary found on
/// the ring and its successor, and every write goes through both phases
/// against the pair.
pub struct TpcMaster {
    config: MasterConfig,
    cache: KvCache,
    registry: Arc<Mutex<Registry>>,
    last_op_id: AtomicU64,
    decision_retries: Arc<AtomicU64>,
}

impl TpcMaster {
    pub fn new(config: MasterConfig) -> Self {
        Self {
            cache: KvCache::new(config.cache_sets, config.cache_set_size),
            registry: Arc::new(Mutex::new(Registry::new(config.expected_slaves))),
            last_op_id: AtomicU64::new(0),
            decision_retries: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn next_op_id(&self) -> OpId {
        self.last_op_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Phase-2 attempts that had to be repeated, over the master's lifetime.
    pub fn decision_retries(&self) -> u64 {
        self.decision_retries.load(Ordering::Relaxed)
    }

    /// Handles a `register` payload of the form `"<id>@<host>:<port>"`.
    pub async fn register_slave(&self, info: &str) -> KvResult<SlaveInfo> {
        let slave = SlaveInfo::parse(info)?;
        let mut registry = self.registry.lock().await;
        if let Some(previous) = registry.get(slave.id) {
            info!("[master] Slave {} moved from {}", slave, previous.addr());
        }
        registry.register(slave.clone())?;
        info!(
            "[master] Registered slave {} ({}/{})",
            slave,
            registry.len(),
            self.config.expected_slaves
        );
        Ok(slave)
    }

    pub async fn has_finished_registration(&self) -> bool {
        self.registry.lock().await.is_complete()
    }

    async fn replicas(&self, key: &str) -> KvResult<(SlaveInfo, SlaveInfo)> {
        let registry = self.registry.lock().await;
        if !registry.is_complete() {
            return Err(KvError::Unknown(REGISTRATION_INCOMPLETE.into()));
        }
        registry
            .replicas(key)
            .ok_or_else(|| KvError::Unknown(REGISTRATION_INCOMPLETE.into()))
    }

    /// Runs a put or del through both phases.
    ///
    /// Returns once the votes are in and the decision is on its way; the
    /// error, if any, names each slave that refused. The key's cache set stays
    /// locked until both slaves acknowledge the decision.
    pub async fn perform_tpc_operation(&self, request: &KvMessage) -> KvResult<()> {
        let key = match request {
            KvMessage::PutReq { key, .. } | KvMessage::DelReq { key, .. } => key.clone(),
            other => {
                return Err(KvError::Protocol(format!(
                    "cannot run 2PC for a {} message",
                    other.type_name()
                )))
            }
        };
        check_key(&key)?;

        let mut set = self.cache.write_lock(&key).await;
        let (primary, secondary) = self.replicas(&key).await?;
        let op_id = self.next_op_id();
        let request = request.with_op_id(op_id);
        debug!(
            "[master] op {}: {} on {} and {}",
            op_id,
            request.type_name(),
            primary,
            secondary
        );

        // phase 1
        let (vote_tx, mut vote_rx) = mpsc::channel(2);
        for (branch, slave) in [primary, secondary].into_iter().enumerate() {
            let vote_tx = vote_tx.clone();
            let request = request.clone();
            let limit = self.config.vote_timeout;
            tokio::spawn(async move {
                let vote = request_vote(&slave, &request, limit).await;
                let _ = vote_tx.send((branch, slave, vote)).await;
            });
        }
        drop(vote_tx);

        let mut failures: [Option<(SlaveInfo, KvError)>; 2] = [None, None];
        let mut votes = 0;
        while let Some((branch, slave, vote)) = vote_rx.recv().await {
            votes += 1;
            if let Err(e) = vote {
                debug!("[master] op {}: slave {} refused: {}", op_id, slave, e);
                failures[branch] = Some((slave, e));
            }
        }
        let commit = votes == 2 && failures.iter().all(Option::is_none);

        if commit {
            match &request {
                KvMessage::PutReq { key, value, .. } => set.put(key, value),
                _ => set.del(&key),
            }
        }
        info!(
            "[master] op {}: {}",
            op_id,
            if commit { "commit" } else { "abort" }
        );

        // phase 2
        let decision = if commit {
            KvMessage::Commit { op_id }
        } else {
            KvMessage::Abort {
                message: None,
                op_id,
            }
        };
        let deliveries: Vec<JoinHandle<()>> = [Replica::Primary, Replica::Secondary]
            .into_iter()
            .map(|replica| {
                tokio::spawn(send_decision(DecisionDelivery {
                    registry: self.registry.clone(),
                    key: key.clone(),
                    replica,
                    decision: decision.clone(),
                    timeout: self.config.vote_timeout,
                    backoff: self.config.decision_backoff,
                    retries: self.decision_retries.clone(),
                }))
            })
            .collect();
        tokio::spawn(async move {
            for delivery in deliveries {
                let _ = delivery.await;
            }
            debug!("[master] op {}: acknowledged by both slaves", op_id);
            drop(set);
        });

        if commit {
            Ok(())
        } else if votes < 2 {
            Err(KvError::Unknown("lost a vote".into()))
        } else {
            Err(combine_failures(failures))
        }
    }

    /// Serves a get from the cache, otherwise from whichever replica has it,
    /// preferring the primary.
    pub async fn handle_get(&self, key: &str) -> KvResult<String> {
        check_key(key)?;
        let mut set = self.cache.write_lock(key).await;
        if let Some(value) = set.get(key) {
            debug!("[master] cache hit for {:?}", key);
            return Ok(value);
        }

        let (primary, secondary) = self.replicas(key).await?;
        let (value_tx, mut value_rx) = mpsc::channel(2);
        for (branch, slave) in [primary, secondary].into_iter().enumerate() {
            let value_tx = value_tx.clone();
            let key = key.to_string();
            let limit = self.config.vote_timeout;
            tokio::spawn(async move {
                let value = fetch(&slave, &key, limit).await;
                let _ = value_tx.send((branch, slave, value)).await;
            });
        }
        drop(value_tx);

        let mut results: [Option<(SlaveInfo, KvResult<String>)>; 2] = [None, None];
        while let Some((branch, slave, value)) = value_rx.recv().await {
            results[branch] = Some((slave, value));
        }

        let mut failures: [Option<(SlaveInfo, KvError)>; 2] = [None, None];
        for (branch, result) in results.into_iter().enumerate() {
            match result {
                Some((_, Ok(value))) => {
                    set.replace(key, &value);
                    return Ok(value);
                }
                Some((slave, Err(e))) => failures[branch] = Some((slave, e)),
                None => {}
            }
        }
        Err(combine_failures(failures))
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &KvCache {
        &self.cache
    }
}

#[derive(Clone, Copy, Debug)]
enum Replica {
    Primary,
    Secondary,
}

struct DecisionDelivery {
    registry: Arc<Mutex<Registry>>,
    key: String,
    replica: Replica,
    decision: KvMessage,
    timeout: Duration,
    backoff: Duration,
    retries: Arc<AtomicU64>,
}

async fn request_vote(slave: &SlaveInfo, request: &KvMessage, limit: Duration) -> KvResult<()> {
    let op_id = request.op_id();
    match exchange(&slave.addr(), request, Some(limit)).await? {
        KvMessage::Ready { op_id: voted } if Some(voted) == op_id => Ok(()),
        KvMessage::Abort { message, .. } => Err(KvError::from_response(
            message.as_deref().unwrap_or("Unknown Error: aborted"),
        )),
        KvMessage::Resp { message } => Err(KvError::from_response(&message)),
        other => Err(KvError::Protocol(format!("unexpected vote {other}"))),
    }
}

async fn fetch(slave: &SlaveInfo, key: &str, limit: Duration) -> KvResult<String> {
    let request = KvMessage::GetReq {
        key: key.to_string(),
    };
    match exchange(&slave.addr(), &request, Some(limit)).await? {
        KvMessage::RespValue { key: got, value } if got == key => Ok(value),
        KvMessage::Resp { message } => Err(KvError::from_response(&message)),
        other => Err(KvError::Protocol(format!("unexpected get reply {other}"))),
    }
}

// Keeps sending until the slave currently holding this replica acks
async fn send_decision(delivery: DecisionDelivery) {
    let op_id = delivery.decision.op_id();
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let target = {
            let registry = delivery.registry.lock().await;
            match delivery.replica {
                Replica::Primary => registry.find_primary(&delivery.key).cloned(),
                Replica::Secondary => registry
                    .find_primary(&delivery.key)
                    .and_then(|primary| registry.find_successor(primary.id))
                    .cloned(),
            }
        };

        let outcome = match &target {
            Some(slave) => {
                exchange(&slave.addr(), &delivery.decision, Some(delivery.timeout)).await
            }
            None => Err(KvError::Unknown("no slave registered".into())),
        };
        match outcome {
            Ok(KvMessage::Ack { op_id: acked }) if Some(acked) == op_id => {
                debug!(
                    "[master] {} acked by {:?} replica after {} attempt(s)",
                    delivery.decision, delivery.replica, attempt
                );
                return;
            }
            Ok(other) => warn!(
                "[master] {} to {:?} replica got {} (attempt {}), retrying",
                delivery.decision, delivery.replica, other, attempt
            ),
            Err(e) => warn!(
                "[master] {} to {:?} replica failed (attempt {}): {}, retrying",
                delivery.decision, delivery.replica, attempt, e
            ),
        }
        delivery.retries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(delivery.backoff).await;
    }
}

// "@<id>:=<message>" per failed branch, primary first
fn combine_failures(failures: [Option<(SlaveInfo, KvError)>; 2]) -> KvError {
    let message = failures
        .iter()
        .flatten()
        .map(|(slave, e)| format!("@{}:={}", slave.signed_id(), e))
        .collect::<Vec<_>>()
        .join("\n");
    KvError::Remote(message)
}
