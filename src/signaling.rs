//! Служебные сообщения ретранслятора. Всё остальное он пересылает как есть.

use crate::config::WELCOME_TEXT;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Отправляется один раз каждому новому подключению
    Welcome { message: String },
    /// Только при включённом `--notify-peer-left`
    PeerLeft { id: String },
}

impl Envelope {
    pub fn welcome() -> Self {
        Envelope::Welcome {
            message: WELCOME_TEXT.to_owned(),
        }
    }

    pub fn to_json(&self) -> String {
        // сериализация enum из строк не может упасть
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Входящее сообщение на стороне клиента
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Envelope(Envelope),
    Negotiation(String),
}

pub fn classify(text: &str) -> Inbound {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => Inbound::Envelope(envelope),
        Err(_) => Inbound::Negotiation(text.to_owned()),
    }
}
