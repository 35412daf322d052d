use crate::error::{KvError, KvResult};
use crate::messages::{check_key, check_key_value, KvMessage, OpId};
use crate::net::{exchange, recv_msg, send_msg, serve};
use crate::server::KvServer;
use crate::wal::{LogEntry, TpcLog};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const IGNORED: &str = "Unknown Error: Ignore this 2PC operation";

#[derive(Clone, Debug)]
pub struct SlaveConfig {
    pub id: u64,
    pub cache_sets: usize,
    pub cache_set_size: usize,
    pub log_path: PathBuf,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            id: 0,
            cache_sets: 10,
            cache_set_size: 10,
            log_path: PathBuf::from("tpckv-slave.log"),
        }
    }
}

/// A 2PC participant. Each connection carries one request: a vote request,
/// a decision, a get, or `ignoreNext`.
pub struct TpcSlave {
    id: u64,
    server: KvServer,
    log: TpcLog,
    // requests that voted but have not seen a decision
    waiting: Mutex<HashMap<OpId, KvMessage>>,
    ignore_next: AtomicBool,
}

impl TpcSlave {
    /// Opens the log, replays it into a fresh store, and picks up whatever
    /// was still in doubt when the previous run stopped.
    pub async fn new(config: SlaveConfig) -> KvResult<Self> {
        let server = KvServer::new(config.cache_sets, config.cache_set_size);
        let log = TpcLog::open(&config.log_path).await?;
        let waiting = log.rebuild(&server).await;
        if !waiting.is_empty() {
            info!(
                "[slave {}] Recovered {} in-doubt operation(s) from {:?}",
                config.id as i64,
                waiting.len(),
                log.path()
            );
        }
        Ok(Self {
            id: config.id,
            server,
            log,
            waiting: Mutex::new(waiting),
            ignore_next: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server(&self) -> &KvServer {
        &self.server
    }

    pub async fn in_doubt(&self) -> Vec<OpId> {
        let mut ids: Vec<OpId> = self.waiting.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Reads one request from the connection and writes one reply.
    pub async fn handle(&self, mut stream: TcpStream) {
        let reply = match recv_msg(&mut stream).await {
            Ok(msg) => self.process(msg).await,
            Err(e @ KvError::Network(_)) => {
                debug!("[slave {}] Dropping connection: {}", self.id as i64, e);
                return;
            }
            Err(e) => e.to_response(),
        };
        if let Err(e) = send_msg(&mut stream, &reply).await {
            warn!("[slave {}] Could not reply: {}", self.id as i64, e);
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, connections: usize) {
        serve(listener, connections, move |stream| {
            let slave = self.clone();
            async move { slave.handle(stream).await }
        })
        .await
    }

    pub async fn process(&self, msg: KvMessage) -> KvMessage {
        match msg {
            KvMessage::PutReq { op_id: Some(_), .. } | KvMessage::DelReq { op_id: Some(_), .. } => {
                self.vote(msg).await
            }
            KvMessage::Commit { .. } | KvMessage::Abort { .. } => self.decide(msg).await,
            KvMessage::GetReq { key } => match self.server.get(&key).await {
                Ok(value) => KvMessage::RespValue { key, value },
                Err(e) => e.to_response(),
            },
            KvMessage::IgnoreNext => {
                self.ignore_next.store(true, Ordering::SeqCst);
                debug!("[slave {}] Will refuse the next vote", self.id as i64);
                KvMessage::success()
            }
            KvMessage::PutReq { .. } | KvMessage::DelReq { .. } => {
                KvError::Protocol("write without a TPCOpId".into()).to_response()
            }
            other => KvError::Protocol(format!("slave cannot handle {}", other.type_name()))
                .to_response(),
        }
    }

    // phase 1
    async fn vote(&self, request: KvMessage) -> KvMessage {
        let Some(op_id) = request.op_id() else {
            return KvError::Protocol("write without a TPCOpId".into()).to_response();
        };
        let Some(entry) = LogEntry::from_message(&request) else {
            return KvError::Protocol("unloggable request".into()).to_response();
        };
        if let Err(e) = self.log.append(&entry).await {
            error!("[slave {}] Could not log op {}: {}", self.id as i64, op_id, e);
            return abort_vote(e.to_string(), op_id);
        }
        self.waiting.lock().await.insert(op_id, request.clone());

        if self.ignore_next.swap(false, Ordering::SeqCst) {
            info!("[slave {}] Refusing op {} as asked", self.id as i64, op_id);
            return abort_vote(IGNORED, op_id);
        }

        let verdict = match &request {
            KvMessage::PutReq { key, value, .. } => check_key_value(key, value),
            KvMessage::DelReq { key, .. } => {
                if let Err(e) = check_key(key) {
                    Err(e)
                } else if self.server.has_key(key).await {
                    Ok(())
                } else {
                    Err(KvError::NotFound)
                }
            }
            _ => Err(KvError::Unknown("this should not happen".into())),
        };
        match verdict {
            Ok(()) => {
                debug!("[slave {}] Ready for {}", self.id as i64, request);
                KvMessage::Ready { op_id }
            }
            Err(e) => abort_vote(e.to_string(), op_id),
        }
    }

    // phase 2
    async fn decide(&self, decision: KvMessage) -> KvMessage {
        let Some(op_id) = decision.op_id() else {
            return KvError::Protocol("decision without a TPCOpId".into()).to_response();
        };
        let commit = matches!(decision, KvMessage::Commit { .. });
        let entry = LogEntry::Decision { op_id, commit };
        if let Err(e) = self.log.append(&entry).await {
            // no ack, so the master tries again
            error!(
                "[slave {}] Could not log decision {}: {}",
                self.id as i64, decision, e
            );
            return e.to_response();
        }

        let original = self.waiting.lock().await.remove(&op_id);
        match (commit, original) {
            (true, Some(request)) => {
                let applied = match &request {
                    KvMessage::PutReq { key, value, .. } => self.server.put(key, value).await,
                    KvMessage::DelReq { key, .. } => self.server.del(key).await,
                    _ => Ok(()),
                };
                match applied {
                    Ok(()) => info!("[slave {}] Committed {}", self.id as i64, request),
                    Err(e) => warn!(
                        "[slave {}] Could not apply {}: {}",
                        self.id as i64, request, e
                    ),
                }
            }
            (true, None) => debug!(
                "[slave {}] Commit for op {} already handled",
                self.id as i64, op_id
            ),
            (false, _) => debug!("[slave {}] Aborted op {}", self.id as i64, op_id),
        }
        KvMessage::Ack { op_id }
    }

    /// Announces this slave to the master as `<id>@<advertised_addr>`.
    /// Returns the master's confirmation text.
    pub async fn register_with_master(
        &self,
        master_addr: &str,
        advertised_addr: &str,
    ) -> KvResult<String> {
        let request = KvMessage::Register {
            message: format!("{}@{}", self.id as i64, advertised_addr),
        };
        match exchange(master_addr, &request, None).await? {
            KvMessage::Resp { message } if message.starts_with("Successfully registered") => {
                info!("[slave {}] {}", self.id as i64, message);
                Ok(message)
            }
            KvMessage::Resp { message } => Err(KvError::from_response(&message)),
            other => Err(KvError::Protocol(format!(
                "unexpected registration reply {other}"
            ))),
        }
    }
}

fn abort_vote(message: impl Into<String>, op_id: OpId) -> KvMessage {
    KvMessage::Abort {
        message: Some(message.into()),
        op_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn slave_in(dir: &TempDir) -> TpcSlave {
        TpcSlave::new(SlaveConfig {
            id: 7,
            log_path: dir.path().join("slave-7.log"),
            ..SlaveConfig::default()
        })
        .await
        .unwrap()
    }

    fn put(op_id: OpId, key: &str, value: &str) -> KvMessage {
        KvMessage::PutReq {
            key: key.into(),
            value: value.into(),
            op_id: Some(op_id),
        }
    }

    fn del(op_id: OpId, key: &str) -> KvMessage {
        KvMessage::DelReq {
            key: key.into(),
            op_id: Some(op_id),
        }
    }

    fn abort(op_id: OpId) -> KvMessage {
        KvMessage::Abort {
            message: None,
            op_id,
        }
    }

    #[tokio::test]
    async fn test_put_commits_after_ready() {
        let dir = TempDir::new().unwrap();
        let slave = slave_in(&dir).await;

        assert_eq!(slave.process(put(1, "k", "v")).await, KvMessage::Ready { op_id: 1 });
        assert_eq!(slave.in_doubt().await, vec![1]);
        assert!(!slave.server().has_key("k").await);

        assert_eq!(
            slave.process(KvMessage::Commit { op_id: 1 }).await,
            KvMessage::Ack { op_id: 1 }
        );
        assert!(slave.in_doubt().await.is_empty());
        assert_eq!(
            slave.process(KvMessage::GetReq { key: "k".into() }).await,
            KvMessage::RespValue {
                key: "k".into(),
                value: "v".into()
            }
        );
    }

    #[tokio::test]
    async fn test_abort_decision_discards_the_write() {
        let dir = TempDir::new().unwrap();
        let slave = slave_in(&dir).await;

        slave.process(put(1, "k", "v")).await;
        assert_eq!(slave.process(abort(1)).await, KvMessage::Ack { op_id: 1 });
        assert!(!slave.server().has_key("k").await);
        assert_eq!(
            slave.process(KvMessage::GetReq { key: "k".into() }).await,
            KvMessage::resp("Does not exist")
        );
    }

    #[tokio::test]
    async fn test_ignore_next_refuses_exactly_one_vote() {
        let dir = TempDir::new().unwrap();
        let slave = slave_in(&dir).await;

        assert_eq!(slave.process(KvMessage::IgnoreNext).await, KvMessage::success());
        assert_eq!(
            slave.process(put(1, "k", "v")).await,
            abort_vote(IGNORED, 1)
        );
        assert_eq!(slave.process(put(2, "k", "v")).await, KvMessage::Ready { op_id: 2 });
    }

    #[tokio::test]
    async fn test_del_votes_on_existence() {
        let dir = TempDir::new().unwrap();
        let slave = slave_in(&dir).await;

        assert_eq!(
            slave.process(del(1, "missing")).await,
            abort_vote("Does not exist", 1)
        );

        slave.process(put(2, "k", "v")).await;
        slave.process(KvMessage::Commit { op_id: 2 }).await;
        assert_eq!(slave.process(del(3, "k")).await, KvMessage::Ready { op_id: 3 });
        slave.process(KvMessage::Commit { op_id: 3 }).await;
        assert!(!slave.server().has_key("k").await);
    }

    #[tokio::test]
    async fn test_repeated_decision_is_acked_without_reapplying() {
        let dir = TempDir::new().unwrap();
        let slave = slave_in(&dir).await;

        slave.process(put(1, "k", "v")).await;
        slave.process(KvMessage::Commit { op_id: 1 }).await;
        slave.process(put(2, "k", "w")).await;
        slave.process(KvMessage::Commit { op_id: 2 }).await;

        assert_eq!(
            slave.process(KvMessage::Commit { op_id: 1 }).await,
            KvMessage::Ack { op_id: 1 }
        );
        assert_eq!(slave.server().get("k").await.unwrap(), "w");
    }

    #[tokio::test]
    async fn test_restart_resolves_in_doubt_operation() {
        let dir = TempDir::new().unwrap();
        {
            let slave = slave_in(&dir).await;
            slave.process(put(1, "a", "1")).await;
            slave.process(KvMessage::Commit { op_id: 1 }).await;
            assert_eq!(slave.process(put(2, "b", "2")).await, KvMessage::Ready { op_id: 2 });
        }

        let slave = slave_in(&dir).await;
        assert_eq!(slave.server().get("a").await.unwrap(), "1");
        assert!(!slave.server().has_key("b").await);
        assert_eq!(slave.in_doubt().await, vec![2]);

        assert_eq!(
            slave.process(KvMessage::Commit { op_id: 2 }).await,
            KvMessage::Ack { op_id: 2 }
        );
        assert_eq!(slave.server().get("b").await.unwrap(), "2");

        // and the decision survives another restart
        drop(slave);
        let slave = slave_in(&dir).await;
        assert!(slave.in_doubt().await.is_empty());
        assert_eq!(slave.server().get("b").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_unexpected_messages_get_an_error_reply() {
        let dir = TempDir::new().unwrap();
        let slave = slave_in(&dir).await;

        let reply = slave
            .process(KvMessage::PutReq {
                key: "k".into(),
                value: "v".into(),
                op_id: None,
            })
            .await;
        assert!(matches!(reply, KvMessage::Resp { .. }));
        let reply = slave.process(KvMessage::Ack { op_id: 1 }).await;
        assert!(matches!(reply, KvMessage::Resp { .. }));
        assert!(slave.in_doubt().await.is_empty());
    }

    #[tokio::test]
    async fn test_handle_serves_over_tcp() {
        let dir = TempDir::new().unwrap();
        let slave = Arc::new(slave_in(&dir).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(slave.clone().serve(listener, 2));

        let reply = exchange(&addr, &put(5, "k", "v"), None).await.unwrap();
        assert_eq!(reply, KvMessage::Ready { op_id: 5 });
        let reply = exchange(&addr, &KvMessage::Commit { op_id: 5 }, None)
            .await
            .unwrap();
        assert_eq!(reply, KvMessage::Ack { op_id: 5 });
        assert!(slave.server().has_key("k").await);
    }
}
