use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::audio::MessageSink;
use crate::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Debug)]
pub enum NetEvent {
    Message(ServerMessage),
    /// The socket ended, for whatever reason. Sent exactly once per connection.
    Closed,
}

struct LinkHandle {
    cmd_tx: mpsc::Sender<String>,
    open: Arc<AtomicBool>,
}

/// Single duplex WebSocket link to the agent backend.
///
/// Cloning yields another handle to the same link. Retry and reconnect are
/// left to the caller.
#[derive(Clone)]
pub struct TransportClient {
    link: Arc<Mutex<Option<LinkHandle>>>,
    queue_capacity: usize,
}

impl TransportClient {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            link: Arc::new(Mutex::new(None)),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Open the socket and start the socket task. Inbound messages and the
    /// final `Closed` go to `events`. A failed handshake only returns the error.
    pub async fn connect(&self, url: &str, events: mpsc::Sender<NetEvent>) -> Result<()> {
        self.close();

        let url = Url::parse(url)?;
        log::info!("Connecting to {}...", url);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        log::info!("Connected!");

        let (cmd_tx, cmd_rx) = mpsc::channel(self.queue_capacity);
        let open = Arc::new(AtomicBool::new(true));
        tokio::spawn(socket_loop(ws_stream, cmd_rx, events, open.clone()));

        if let Ok(mut link) = self.link.lock() {
            *link = Some(LinkHandle { cmd_tx, open });
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.link
            .lock()
            .map(|link| {
                link.as_ref()
                    .is_some_and(|h| h.open.load(Ordering::SeqCst) && !h.cmd_tx.is_closed())
            })
            .unwrap_or(false)
    }

    /// Queue one message for the socket. Silently dropped when not open.
    pub fn send(&self, message: &ClientMessage) {
        let Ok(link) = self.link.lock() else {
            return;
        };
        let Some(handle) = link.as_ref() else {
            return;
        };
        if !handle.open.load(Ordering::SeqCst) {
            return;
        }

        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize {} message: {}", message.type_name(), e);
                return;
            }
        };
        if !matches!(message, ClientMessage::Audio { .. }) {
            log::debug!("send type={} len={}", message.type_name(), text.len());
        }
        match handle.cmd_tx.try_send(text) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Socket send queue full, dropping {} message", message.type_name());
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Best-effort close. Idempotent; `is_open()` is false afterwards.
    pub fn close(&self) {
        let handle = match self.link.lock() {
            Ok(mut link) => link.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.open.store(false, Ordering::SeqCst);
            // Dropping the sender makes the socket task send a close frame and exit.
            drop(handle.cmd_tx);
        }
    }
}

impl MessageSink for TransportClient {
    fn is_open(&self) -> bool {
        TransportClient::is_open(self)
    }

    fn send(&self, message: &ClientMessage) {
        TransportClient::send(self, message)
    }
}

async fn socket_loop<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut cmd_rx: mpsc::Receiver<String>,
    events: mpsc::Sender<NetEvent>,
    open: Arc<AtomicBool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => {
                                if events.send(NetEvent::Message(message)).await.is_err() {
                                    break;
                                }
                            }
                            // 非法帧直接丢弃，连接保持
                            Err(e) => log::debug!("Dropping malformed frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            log::warn!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    let _ = events.send(NetEvent::Closed).await;
    log::info!("WebSocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn server() -> (String, tokio::task::JoinHandle<tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        (format!("ws://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_send_is_noop_when_not_open() {
        let client = TransportClient::new(8);
        assert!(!client.is_open());
        client.send(&ClientMessage::Ping);
        client.close();
        client.close();
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_round_trip_and_malformed_frames() {
        let (url, server) = server().await;
        let client = TransportClient::new(8);
        let (tx, mut rx) = mpsc::channel(8);
        client.connect(&url, tx).await.unwrap();
        let mut ws = server.await.unwrap();
        assert!(client.is_open());

        client.send(&ClientMessage::Ping);
        let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(msg.into_text().unwrap().as_str(), r#"{"type":"ping"}"#);

        ws.send(Message::Text("{not json".into())).await.unwrap();
        ws.send(Message::Text(r#"{"type":"pong"}"#.into())).await.unwrap();
        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, NetEvent::Message(ServerMessage::Pong)));
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_server_close_emits_closed_once() {
        let (url, server) = server().await;
        let client = TransportClient::new(8);
        let (tx, mut rx) = mpsc::channel(8);
        client.connect(&url, tx).await.unwrap();
        let mut ws = server.await.unwrap();

        ws.close(None).await.unwrap();
        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, NetEvent::Closed));
        // The sender is gone once the socket task ends: no second Closed.
        assert!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_none());
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_local_close_is_immediate() {
        let (url, server) = server().await;
        let client = TransportClient::new(8);
        let (tx, mut rx) = mpsc::channel(8);
        client.connect(&url, tx).await.unwrap();
        let _ws = server.await.unwrap();

        client.close();
        assert!(!client.is_open());
        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, NetEvent::Closed));
    }

    #[tokio::test]
    async fn test_connect_failure_returns_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = TransportClient::new(8);
        let (tx, _rx) = mpsc::channel(8);
        assert!(client.connect(&format!("ws://{}", addr), tx).await.is_err());
        assert!(!client.is_open());
    }
}
