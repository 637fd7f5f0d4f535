use serde::{Deserialize, Serialize};
use std::fmt;

/// Роль в переговорах
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Receiver,
}

/// Тип описания сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    /// Offer создаёт вызывающая сторона, answer принимающая
    pub fn sender_role(self) -> Role {
        match self {
            DescriptionKind::Offer => Role::Caller,
            DescriptionKind::Answer => Role::Receiver,
        }
    }
}

impl fmt::Display for DescriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptionKind::Offer => f.write_str("offer"),
            DescriptionKind::Answer => f.write_str("answer"),
        }
    }
}

/// Вид локального трека
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Краткое описание медиа-возможностей стороны
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaSummary {
    pub audio: bool,
    pub video: bool,
}

/// ICE кандидат в составе итогового описания
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Полный пакет: SDP вместе со всеми собранными кандидатами.
/// Отправляется одним сообщением, только после завершения сбора.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub role: Role,
    pub session_id: String,
    pub sdp: String,
    pub media: MediaSummary,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
    pub ts: i64,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}
