use crate::error::{RelayError, SessionError, SessionResult};
use crate::peer::delivery::Delivery;
use crate::signaling::{classify, Envelope, Inbound};
use crate::utils::fingerprint;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Клиент ретранслятора: отправляет описания и отдаёт входящие по порядку
pub struct RelayClient {
    tx: Mutex<SplitSink<WsStream, Message>>,
    rx: Mutex<SplitStream<WsStream>>,
}

impl RelayClient {
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let (stream, _) = connect_async(url).await?;
        info!("Connected to relay {url}");
        let (tx, rx) = stream.split();
        Ok(Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        })
    }

    pub async fn send_text(&self, text: &str) -> Result<(), RelayError> {
        self.tx.lock().await.send(Message::Text(text.to_owned())).await?;
        Ok(())
    }

    /// Следующее сообщение переговоров. Служебные сообщения ретранслятора
    /// только логируются. `None`, если соединение закрыто.
    pub async fn recv(&self) -> Result<Option<String>, RelayError> {
        let mut rx = self.rx.lock().await;
        while let Some(msg) = rx.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!("Skipping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => return Ok(None),
                _ => continue,
            };
            match classify(&text) {
                Inbound::Envelope(Envelope::Welcome { message }) => info!("Relay says: {message}"),
                Inbound::Envelope(Envelope::PeerLeft { id }) => info!("Relay peer {id} left"),
                Inbound::Negotiation(payload) => {
                    debug!("Received payload, fingerprint {}", fingerprint(&payload));
                    return Ok(Some(payload));
                }
            }
        }
        Ok(None)
    }

    pub async fn close(&self) {
        let _ = self.tx.lock().await.close().await;
    }
}

#[async_trait]
impl Delivery for RelayClient {
    async fn deliver(&self, payload: &str) -> SessionResult<()> {
        debug!("Sending payload, fingerprint {}", fingerprint(payload));
        self.send_text(payload)
            .await
            .map_err(|e| SessionError::Delivery(e.to_string()))
    }
}
