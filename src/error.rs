use thiserror::Error;

/// Ошибки уровня переговоров. Любая из них означает отклонённый переход:
/// состояние сессии остаётся прежним.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("media access failed: {0}")]
    MediaAccess(String),

    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    #[error("invalid answer: {0}")]
    InvalidAnswer(String),

    #[error("no active session for this operation (state: {0})")]
    NoActiveSession(String),

    #[error("a session is already active (state: {0})")]
    SessionAlreadyActive(String),

    #[error("another negotiation step is already in flight")]
    NegotiationInProgress,

    #[error("meeting id must not be blank")]
    InvalidMeetingId,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl From<webrtc::Error> for SessionError {
    fn from(e: webrtc::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

/// Ошибки ретранслятора. Наружу, к отправителю, не попадают никогда.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("delivery to connection {id} failed: {reason}")]
    Delivery { id: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Ошибки разбора полезной нагрузки переговоров
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not valid gzip: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("payload exceeds {0} bytes once decompressed")]
    TooLarge(u64),

    #[error("payload has unexpected shape: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected {expected} description, got {actual}")]
    KindMismatch { expected: String, actual: String },

    #[error("{kind} description cannot come from the {role} side")]
    RoleMismatch { kind: String, role: String },

    #[error("session description carries no sdp")]
    EmptySdp,
}

pub type SessionResult<T> = Result<T, SessionError>;
