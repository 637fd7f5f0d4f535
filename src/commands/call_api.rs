use crate::error::{SessionError, SessionResult};
use crate::peer::codec;
use crate::peer::controller::NegotiationController;
use crate::peer::delivery::Delivery;
use crate::peer::state::SessionState;
use crate::peer::types::{DescriptionKind, SessionDescription};
use std::sync::Arc;
use tracing::{debug, info};

/// Формат, в котором описания уходят второй стороне
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// JSON как есть, для ретранслятора
    Json,
    /// gzip + base64, короче для ручного копирования
    Compact,
}

/// Вход через роли: A создаёт offer, B отвечает answer
pub struct CallApi {
    controller: Arc<NegotiationController>,
    delivery: Arc<dyn Delivery>,
    format: PayloadFormat,
}

impl CallApi {
    pub fn new(
        controller: Arc<NegotiationController>,
        delivery: Arc<dyn Delivery>,
        format: PayloadFormat,
    ) -> Self {
        Self {
            controller,
            delivery,
            format,
        }
    }

    pub fn controller(&self) -> &Arc<NegotiationController> {
        &self.controller
    }

    fn encode(&self, desc: &SessionDescription) -> SessionResult<String> {
        let encoded = match self.format {
            PayloadFormat::Json => codec::encode(desc),
            PayloadFormat::Compact => codec::encode_compact(desc),
        };
        encoded.map_err(|e| SessionError::Transport(format!("cannot encode description: {e}")))
    }

    pub async fn start_camera(&self) -> SessionResult<()> {
        self.controller.start_capture().await
    }

    /// A-сторона: создаём OFFER и отправляем его
    pub async fn start_call(&self) -> SessionResult<String> {
        let offer = self.controller.create_offer().await?;
        let payload = self.encode(&offer)?;
        self.delivery.deliver(&payload).await?;
        info!("Offer sent, encoded length: {}", payload.len());
        Ok(payload)
    }

    /// B-сторона: принимаем OFFER, делаем ANSWER и отправляем
    pub async fn answer_call(&self, offer: &str) -> SessionResult<String> {
        self.controller.accept_offer(offer).await?;
        let answer = self.controller.create_answer().await?;
        let payload = self.encode(&answer)?;
        self.delivery.deliver(&payload).await?;
        info!("Answer sent, encoded length: {}", payload.len());
        Ok(payload)
    }

    /// A-сторона: получаем ANSWER и завершаем handshake
    pub async fn complete_call(&self, answer: &str) -> SessionResult<()> {
        self.controller.set_remote_answer(answer).await
    }

    pub async fn hang_up(&self) -> bool {
        self.controller.end_call().await
    }

    /// Разбирает входящее сообщение из канала доставки и выполняет подходящий
    /// шаг. Возвращает false, если сообщение в текущем состоянии не нужно.
    pub async fn handle_inbound(&self, payload: &str) -> SessionResult<bool> {
        let state = self.controller.state();
        match (codec::peek_kind(payload), state) {
            (Some(DescriptionKind::Offer), SessionState::CameraReady) => {
                self.answer_call(payload).await?;
                Ok(true)
            }
            (Some(DescriptionKind::Answer), SessionState::AwaitingAnswer) => {
                self.complete_call(payload).await?;
                Ok(true)
            }
            (kind, state) => {
                debug!("Ignoring inbound {kind:?} in state {state}");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::controller::tests::controller;
    use crate::peer::delivery::ManualCopy;

    #[tokio::test]
    async fn manual_copy_round_trip_connects_caller() {
        let (caller_ctrl, _) = controller();
        let (receiver_ctrl, _) = controller();
        let caller_out = Arc::new(ManualCopy::new());
        let receiver_out = Arc::new(ManualCopy::new());
        let caller = CallApi::new(caller_ctrl, caller_out.clone(), PayloadFormat::Compact);
        let receiver = CallApi::new(receiver_ctrl, receiver_out.clone(), PayloadFormat::Compact);

        caller.start_camera().await.unwrap();
        receiver.start_camera().await.unwrap();

        caller.start_call().await.unwrap();
        let offer = caller_out.take().unwrap();

        assert!(receiver.handle_inbound(&offer).await.unwrap());
        assert_eq!(receiver.controller().state(), SessionState::AnswerCreated);
        let answer = receiver_out.take().unwrap();

        // offer повторно в AwaitingAnswer не нужен
        assert!(!caller.handle_inbound(&offer).await.unwrap());
        assert!(caller.handle_inbound(&answer).await.unwrap());
        assert_eq!(caller.controller().state(), SessionState::Connected);

        assert!(caller.hang_up().await);
        assert_eq!(caller.controller().state(), SessionState::Idle);
    }
}
