pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::RelayConfig;
pub use error::{PayloadError, RelayError, SessionError, SessionResult};
pub use peer::{NegotiationController, SessionEvent, SessionState};
pub use relay::{RelayClient, RelayServer};
pub use session::{PeerSession, SessionInfo};

/// Запуск ретранслятора до остановки процесса
pub async fn run_relay(config: RelayConfig) -> Result<(), RelayError> {
    let server = relay::RelayServer::bind(&config).await?;
    server.run().await;
    Ok(())
}
