//! WebSocket сервер ретранслятора: одна задача чтения и одна задача записи
//! на подключение.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::hub::Hub;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

pub struct RelayServer {
    listener: TcpListener,
    hub: Arc<Hub>,
}

/// Запущенный в фоне сервер
pub struct RelayHandle {
    pub addr: SocketAddr,
    pub hub: Arc<Hub>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        Self::bind_addr(&config.bind_addr(), config.notify_peer_left).await
    }

    pub async fn bind_addr(addr: &str, notify_peer_left: bool) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hub: Arc::new(Hub::new(notify_peer_left)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Принимает подключения, пока задачу не остановят
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Signaling relay running on ws://{addr}");
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let hub = Arc::clone(&self.hub);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, hub).await {
                            warn!("Connection ended with error: {e}");
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {e}"),
            }
        }
    }

    pub fn spawn(self) -> Result<RelayHandle, RelayError> {
        let addr = self.local_addr()?;
        let hub = self.hub();
        let task = tokio::spawn(self.run());
        Ok(RelayHandle { addr, hub, task })
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(stream: TcpStream, hub: Arc<Hub>) -> Result<(), RelayError> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (conn, mut outbound) = hub.connect();
    debug!("Connection {} from {addr}", conn.id);

    // Task to forward queued messages to the socket
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if let Err(e) = ws_tx.send(msg).await {
                writer_conn.mark_closed();
                let err = RelayError::Delivery {
                    id: writer_conn.id.clone(),
                    reason: e.to_string(),
                };
                warn!("{err}");
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                hub.broadcast(&conn.id, msg);
            }
            Ok(Message::Close(_)) => {
                info!("Connection {} closed by client", conn.id);
                break;
            }
            // ping/pong обрабатывает tungstenite, дальше не пересылаем
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error on {}: {e}", conn.id);
                break;
            }
        }
    }

    conn.mark_closed();
    hub.disconnect(&conn.id);
    writer.abort();
    Ok(())
}
