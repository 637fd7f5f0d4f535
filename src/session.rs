use crate::peer::media::LocalTrack;
use crate::peer::state::SessionState;
use crate::peer::transport::PeerTransport;
use crate::peer::types::{Role, SessionDescription};
use std::sync::Arc;

/// Состояние одной попытки звонка на стороне клиента.
/// Существует от захвата камеры до завершения звонка.
pub struct PeerSession {
    pub id: String,
    pub role: Option<Role>,
    pub state: SessionState,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub tracks: Vec<Arc<LocalTrack>>,
    pub(crate) transport: Option<Arc<dyn PeerTransport>>,
}

impl PeerSession {
    pub fn new(id: String, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id,
            role: None,
            state: SessionState::CameraReady,
            local_description: None,
            remote_description: None,
            tracks,
            transport: None,
        }
    }
}

/// Снимок сессии для UI, без ссылок на транспорт
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub role: Option<Role>,
    pub state: SessionState,
    pub has_local_description: bool,
    pub has_remote_description: bool,
    pub track_count: usize,
}

impl From<&PeerSession> for SessionInfo {
    fn from(s: &PeerSession) -> Self {
        Self {
            id: s.id.clone(),
            role: s.role,
            state: s.state,
            has_local_description: s.local_description.is_some(),
            has_remote_description: s.remote_description.is_some(),
            track_count: s.tracks.len(),
        }
    }
}
