use crate::error::{KvError, KvResult};
use crate::messages::{KvMessage, MAX_VALUE_LENGTH};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Semaphore,
};
use tracing::{debug, error, info};

// worst case escaped value plus the envelope
const MAX_MESSAGE_BYTES: usize = 6 * MAX_VALUE_LENGTH + 64 * 1024;

// Writes one message and half-closes the write side so the peer sees EOF
pub async fn send_msg<W>(stream: &mut W, msg: &KvMessage) -> KvResult<()>
where
    W: AsyncWrite + Unpin,
{
    let xml = msg.to_xml()?;
    let send_error = |_| KvError::network("Could not send data");
    stream.write_all(xml.as_bytes()).await.map_err(send_error)?;
    stream.flush().await.map_err(send_error)?;
    stream.shutdown().await.map_err(send_error)?;
    Ok(())
}

// Reads to EOF and decodes exactly one message
pub async fn recv_msg<R>(stream: &mut R) -> KvResult<KvMessage>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    (&mut *stream)
        .take(MAX_MESSAGE_BYTES as u64 + 1)
        .read_to_end(&mut buffer)
        .await
        .map_err(|_| KvError::network("Could not receive data"))?;
    if buffer.len() > MAX_MESSAGE_BYTES {
        return Err(KvError::Xml);
    }
    let text = std::str::from_utf8(&buffer).map_err(|_| KvError::Xml)?;
    KvMessage::from_xml(text)
}

pub async fn connect(addr: &str) -> KvResult<TcpStream> {
    let stream = TcpStream::connect(addr).await.map_err(|e| {
        debug!("Connection to {} failed: {}", addr, e);
        KvError::network("Could not connect")
    })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// One request/response round trip on a fresh connection. With a timeout,
/// the whole exchange (connect included) must finish in time.
pub async fn exchange(
    addr: &str,
    msg: &KvMessage,
    timeout: Option<Duration>,
) -> KvResult<KvMessage> {
    let round_trip = async {
        let mut stream = connect(addr).await?;
        send_msg(&mut stream, msg).await?;
        recv_msg(&mut stream).await
    };
    match timeout {
        Some(limit) => tokio::time::timeout(limit, round_trip)
            .await
            .map_err(|_| KvError::network("Could not receive data"))?,
        None => round_trip.await,
    }
}

/// Accepts connections forever, running `handler` on its own task for each
/// one. At most `connections` handlers run at once; further connections wait
/// in the accept backlog.
pub async fn serve<H, F>(listener: TcpListener, connections: usize, handler: H)
where
    H: Fn(TcpStream) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(connections.max(1)));
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    info!("[{}] Serving with {} worker(s)", local, connections.max(1));

    loop {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break, // semaphore closed
        };
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("[{}] Accepted connection from {}", local, addr);
                let _ = stream.set_nodelay(true);
                let work = handler(stream);
                tokio::spawn(async move {
                    work.await;
                    drop(permit);
                });
            }
            Err(e) => error!("[{}] Accept failed: {}", local, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_message_crosses_a_pipe() {
        let (mut client, mut server) = duplex(64 * 1024);
        let msg = KvMessage::GetReq { key: "k".into() };
        send_msg(&mut client, &msg).await.unwrap();
        assert_eq!(recv_msg(&mut server).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_garbage_is_unparseable() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"not xml at all").await.unwrap();
        client.shutdown().await.unwrap();
        assert_eq!(recv_msg(&mut server).await, Err(KvError::Xml));
    }

    #[tokio::test]
    async fn test_exchange_against_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, 2, |mut stream: TcpStream| async move {
            if let Ok(msg) = recv_msg(&mut stream).await {
                let _ = send_msg(&mut stream, &msg).await;
            }
        }));

        let msg = KvMessage::Register {
            message: "1@localhost:80".into(),
        };
        let reply = exchange(&addr, &msg, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply, msg);
    }

    #[tokio::test]
    async fn test_exchange_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let result = exchange(&addr, &KvMessage::IgnoreNext, Some(Duration::from_millis(100))).await;
        assert_eq!(result, Err(KvError::network("Could not receive data")));
    }

    #[tokio::test]
    async fn test_connect_failure_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = exchange(&addr, &KvMessage::IgnoreNext, None).await;
        assert_eq!(result, Err(KvError::network("Could not connect")));
    }
}
