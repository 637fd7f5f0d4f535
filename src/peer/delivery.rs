use crate::error::SessionResult;
use crate::utils::fingerprint;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

/// Канал доставки описаний второй стороне
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, payload: &str) -> SessionResult<()>;
}

/// Ручная доставка: пользователь сам копирует текст второй стороне
#[derive(Default)]
pub struct ManualCopy {
    last: Mutex<Option<String>>,
}

impl ManualCopy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Последний текст, который надо передать второй стороне
    pub fn take(&self) -> Option<String> {
        self.last.lock().take()
    }

    pub fn peek(&self) -> Option<String> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl Delivery for ManualCopy {
    async fn deliver(&self, payload: &str) -> SessionResult<()> {
        info!(
            "Payload ready for manual copy: {} bytes, fingerprint {}",
            payload.len(),
            fingerprint(payload)
        );
        *self.last.lock() = Some(payload.to_owned());
        Ok(())
    }
}
