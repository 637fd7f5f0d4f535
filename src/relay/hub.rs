use crate::error::RelayError;
use crate::signaling::Envelope;
use crate::utils::random_id;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Открытое подключение к ретранслятору
pub struct Connection {
    pub id: String,
    alive: AtomicBool,
    tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Кладёт сообщение в очередь подключения, не дожидаясь сокета
    pub fn send(&self, msg: Message) -> Result<(), RelayError> {
        if !self.is_alive() {
            return Err(RelayError::Delivery {
                id: self.id.clone(),
                reason: "connection is closing".into(),
            });
        }
        self.tx.send(msg).map_err(|_| {
            self.mark_closed();
            RelayError::Delivery {
                id: self.id.clone(),
                reason: "writer has stopped".into(),
            }
        })
    }
}

/// Набор активных подключений. Содержимое сообщений не разбирается.
pub struct Hub {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    notify_peer_left: bool,
}

impl Hub {
    pub fn new(notify_peer_left: bool) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            notify_peer_left,
        }
    }

    /// Регистрирует подключение и отправляет ему приветствие
    pub fn connect(&self) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            id: random_id(),
            alive: AtomicBool::new(true),
            tx,
        });

        if let Err(e) = conn.send(Message::Text(Envelope::welcome().to_json())) {
            warn!("Failed to queue welcome: {e}");
        }
        self.connections
            .write()
            .insert(conn.id.clone(), Arc::clone(&conn));
        info!("Connection {} joined, {} active", conn.id, self.len());
        (conn, rx)
    }

    /// Рассылает сообщение всем живым подключениям, кроме отправителя.
    /// Сбой одного получателя не влияет на остальных и не виден отправителю.
    pub fn broadcast(&self, from: &str, msg: Message) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .read()
            .values()
            .filter(|c| c.id != from)
            .cloned()
            .collect();

        let mut delivered = 0;
        for conn in targets {
            if !conn.is_alive() {
                continue;
            }
            match conn.send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("{e}"),
            }
        }
        debug!("Relayed message from {from} to {delivered} peers");
        delivered
    }

    pub fn disconnect(&self, id: &str) {
        let removed = self.connections.write().remove(id);
        let Some(conn) = removed else {
            return;
        };
        conn.mark_closed();
        info!("Connection {id} left, {} active", self.len());

        if self.notify_peer_left {
            let notice = Envelope::PeerLeft { id: id.to_owned() }.to_json();
            self.broadcast(id, Message::Text(notice));
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
