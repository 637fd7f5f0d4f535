// Конфигурация приложения
// Уровень логирования по умолчанию зависит от режима сборки

use crate::peer::types::ServerConfig;
use clap::Parser;
use once_cell::sync::Lazy;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "peerlink_lib=debug,peerlink_relay=debug,info";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Порт ретранслятора по умолчанию
pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Текст приветствия, который получает каждое новое подключение
pub const WELCOME_TEXT: &str = "Connected to signaling server";

/// Публичные STUN серверы, если пользователь не задал свои
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![ServerConfig {
        id: "default-stun".into(),
        r#type: "stun".into(),
        url: "stun:stun.l.google.com:19302".into(),
        username: None,
        credential: None,
    }]
});

/// Broadcast signaling relay
///
/// Forwards every message from one WebSocket client to all other connected clients.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct RelayConfig {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0", env = "PEERLINK_RELAY_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT, env = "PEERLINK_RELAY_PORT")]
    pub port: u16,

    /// Tell the remaining clients when a connection goes away
    #[arg(long, default_value_t = false, env = "PEERLINK_NOTIFY_PEER_LEFT")]
    pub notify_peer_left: bool,

    /// Log filter directives (tracing EnvFilter syntax)
    #[arg(long, env = "RUST_LOG")]
    pub log_filter: Option<String>,
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_RELAY_PORT,
            notify_peer_left: false,
            log_filter: None,
        }
    }
}
