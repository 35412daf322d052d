use crate::error::KvError;
use crate::master::{TpcMaster, REGISTRATION_INCOMPLETE};
use crate::messages::KvMessage;
use crate::net::{recv_msg, send_msg, serve};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

// Reads one message, or hands back the reply for a message that failed to decode
async fn read_request(stream: &mut TcpStream) -> Result<KvMessage, Option<KvMessage>> {
    match recv_msg(stream).await {
        Ok(msg) => Ok(msg),
        Err(e @ KvError::Network(_)) => {
            debug!("Dropping connection: {}", e);
            Err(None)
        }
        Err(e) => Err(Some(e.to_response())),
    }
}

async fn reply(stream: &mut TcpStream, msg: &KvMessage) {
    if let Err(e) = send_msg(stream, msg).await {
        warn!("Could not reply {}: {}", msg, e);
    }
}

/// Serves one client request against the master.
pub(crate) async fn handle_client(master: &TpcMaster, mut stream: TcpStream) {
    let request = match read_request(&mut stream).await {
        Ok(msg) => msg,
        Err(Some(error)) => return reply(&mut stream, &error).await,
        Err(None) => return,
    };
    let response = client_response(master, request).await;
    reply(&mut stream, &response).await;
}

async fn client_response(master: &TpcMaster, request: KvMessage) -> KvMessage {
    if !master.has_finished_registration().await {
        return KvError::Unknown(REGISTRATION_INCOMPLETE.into()).to_response();
    }
    match request {
        KvMessage::GetReq { key } => match master.handle_get(&key).await {
            Ok(value) => KvMessage::RespValue { key, value },
            Err(e) => e.to_response(),
        },
        KvMessage::PutReq { .. } | KvMessage::DelReq { .. } => {
            match master.perform_tpc_operation(&request).await {
                Ok(()) => KvMessage::success(),
                Err(e) => e.to_response(),
            }
        }
        _ => KvError::Unknown("server received a response message".into()).to_response(),
    }
}

/// Serves one `register` request from a slave.
pub(crate) async fn handle_registration(master: &TpcMaster, mut stream: TcpStream) {
    let request = match read_request(&mut stream).await {
        Ok(msg) => msg,
        Err(Some(error)) => return reply(&mut stream, &error).await,
        Err(None) => return,
    };
    let response = match request {
        KvMessage::Register { message } => match master.register_slave(&message).await {
            Ok(slave) => KvMessage::resp(format!("Successfully registered {slave}")),
            Err(e) => {
                warn!("Refused registration {:?}: {}", message, e);
                e.to_response()
            }
        },
        _ => KvError::Unknown("cannot recognize the message type".into()).to_response(),
    };
    reply(&mut stream, &response).await;
}

pub async fn serve_clients(master: Arc<TpcMaster>, listener: TcpListener, connections: usize) {
    serve(listener, connections, move |stream| {
        let master = master.clone();
        async move { handle_client(&master, stream).await }
    })
    .await
}

pub async fn serve_registrations(
    master: Arc<TpcMaster>,
    listener: TcpListener,
    connections: usize,
) {
    serve(listener, connections, move |stream| {
        let master = master.clone();
        async move { handle_registration(&master, stream).await }
    })
    .await
}
