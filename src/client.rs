use crate::error::{KvError, KvResult};
use crate::messages::{check_key, check_key_value, KvMessage, SUCCESS};
use crate::net::exchange;
use tracing::debug;

/// Talks to a master (or, for `ignore_next`, a slave). One connection per
/// call.
#[derive(Clone, Debug)]
pub struct KvClient {
    server: String,
}

impl KvClient {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        check_key_value(key, value)?;
        let request = KvMessage::PutReq {
            key: key.to_string(),
            value: value.to_string(),
            op_id: None,
        };
        self.expect_success(&request).await
    }

    pub async fn get(&self, key: &str) -> KvResult<String> {
        check_key(key)?;
        let request = KvMessage::GetReq {
            key: key.to_string(),
        };
        match self.send(&request).await? {
            KvMessage::RespValue { value, .. } => Ok(value),
            KvMessage::Resp { message } => Err(KvError::from_response(&message)),
            other => Err(KvError::Protocol(format!("unexpected reply {other}"))),
        }
    }

    pub async fn del(&self, key: &str) -> KvResult<()> {
        check_key(key)?;
        let request = KvMessage::DelReq {
            key: key.to_string(),
            op_id: None,
        };
        self.expect_success(&request).await
    }

    /// Makes a slave refuse its next vote.
    pub async fn ignore_next(&self) -> KvResult<()> {
        self.expect_success(&KvMessage::IgnoreNext).await
    }

    async fn send(&self, request: &KvMessage) -> KvResult<KvMessage> {
        debug!("Sending {} to {}", request, self.server);
        exchange(&self.server, request, None).await
    }

    async fn expect_success(&self, request: &KvMessage) -> KvResult<()> {
        match self.send(request).await? {
            KvMessage::Resp { message } if message == SUCCESS => Ok(()),
            KvMessage::Resp { message } => Err(KvError::from_response(&message)),
            other => Err(KvError::Protocol(format!("unexpected reply {other}"))),
        }
    }
}
