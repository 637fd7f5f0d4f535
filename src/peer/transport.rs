use crate::error::{SessionError, SessionResult};
use crate::peer::media::LocalTrack;
use crate::peer::types::{IceCandidate, Role, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// Состояние связности нижележащего транспорта
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Сигнал завершения сбора кандидатов. Срабатывает ровно один раз
/// и отдаёт итоговый список кандидатов.
pub struct GatheringComplete {
    rx: oneshot::Receiver<Vec<IceCandidate>>,
}

impl GatheringComplete {
    pub fn channel() -> (oneshot::Sender<Vec<IceCandidate>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Уже завершённый сбор (например, транспорт без ICE)
    pub fn ready(candidates: Vec<IceCandidate>) -> Self {
        let (tx, done) = Self::channel();
        let _ = tx.send(candidates);
        done
    }

    pub async fn wait(self) -> SessionResult<Vec<IceCandidate>> {
        self.rx
            .await
            .map_err(|_| SessionError::Transport("candidate gathering was abandoned".into()))
    }
}

/// Одно peer-to-peer соединение, через которое идут переговоры
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn attach_tracks(&self, tracks: &[Arc<LocalTrack>]) -> SessionResult<()>;

    /// Создаёт offer, ставит его локальным описанием и запускает сбор кандидатов
    async fn create_offer(&self) -> SessionResult<GatheringComplete>;

    /// То же для answer; требует уже применённого удалённого offer
    async fn create_answer(&self) -> SessionResult<GatheringComplete>;

    /// Применяет удалённое описание вместе с его кандидатами
    async fn apply_remote(&self, desc: &SessionDescription) -> SessionResult<()>;

    /// SDP локального описания; после завершения сбора содержит все кандидаты
    async fn local_sdp(&self) -> SessionResult<String>;

    fn state(&self) -> watch::Receiver<TransportState>;

    async fn close(&self);
}

/// Открывает транспорт для новой сессии
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, role: Role, session_id: &str) -> SessionResult<Arc<dyn PeerTransport>>;
}
