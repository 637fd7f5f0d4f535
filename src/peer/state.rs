use serde::Serialize;
use std::fmt;

/// Состояние одной попытки звонка
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    CameraReady,
    OfferCreated,
    OfferReceived,
    AwaitingAnswer,
    AnswerCreated,
    Connected,
    Ended,
}

impl SessionState {
    /// Допустимые переходы. Всё остальное отклоняется без изменения состояния.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, CameraReady)
                | (CameraReady, OfferCreated)
                | (CameraReady, OfferReceived)
                | (OfferCreated, AwaitingAnswer)
                | (OfferReceived, AnswerCreated)
                | (AwaitingAnswer, Connected)
                | (AnswerCreated, Connected)
                | (Ended, Idle)
                // откат при сбое транспорта
                | (OfferCreated, CameraReady)
                | (OfferReceived, CameraReady)
                | (AnswerCreated, OfferReceived)
        ) || (to == Ended && self != Idle && self != Ended)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
