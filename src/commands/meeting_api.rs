//! Вход через код встречи. Только создаёт код и включает камеру:
//! соединение появится, лишь если стороны отдельно обменяются
//! offer/answer через `CallApi`.

use crate::error::{SessionError, SessionResult};
use crate::peer::controller::NegotiationController;
use crate::peer::types::TrackKind;
use crate::utils::meeting_code;
use std::sync::Arc;
use tracing::info;

/// Длина кода встречи
pub const MEETING_ID_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingRecord {
    pub id: String,
    pub created_at: i64,
}

/// Локальное состояние экрана встречи
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingView {
    pub id: String,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
}

pub struct MeetingRegistry {
    controller: Arc<NegotiationController>,
}

impl MeetingRegistry {
    pub fn new(controller: Arc<NegotiationController>) -> Self {
        Self { controller }
    }

    /// Новый код встречи. Ни уникальность, ни хранение не обеспечиваются.
    pub fn create_meeting(&self) -> MeetingRecord {
        let record = MeetingRecord {
            id: meeting_code(MEETING_ID_LEN),
            created_at: chrono::Utc::now().timestamp(),
        };
        info!("Created meeting {}", record.id);
        record
    }

    pub async fn join_meeting(&self, id: &str) -> SessionResult<MeetingView> {
        let id = id.trim();
        if id.is_empty() {
            return Err(SessionError::InvalidMeetingId);
        }
        let id = id.to_uppercase();

        self.controller.start_capture().await?;
        let media = self.controller.media();
        info!("Joined meeting {id} (local capture only)");
        Ok(MeetingView {
            id,
            mic_enabled: media.is_enabled(TrackKind::Audio).unwrap_or(false),
            camera_enabled: media.is_enabled(TrackKind::Video).unwrap_or(false),
        })
    }
}
