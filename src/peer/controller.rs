//! Машина состояний переговоров для одного звонка.
//!
//! Операции асинхронные, но одновременно выполняется только одна: вторая
//! отклоняется сразу, без очереди. `end_call` можно вызвать в любой момент,
//! в том числе посреди переговоров.

use crate::error::{SessionError, SessionResult};
use crate::peer::codec;
use crate::peer::media::{MediaDevices, MediaSession};
use crate::peer::state::SessionState;
use crate::peer::transport::{GatheringComplete, PeerTransport, TransportFactory, TransportState};
use crate::peer::types::{DescriptionKind, IceCandidate, Role, SessionDescription};
use crate::session::{PeerSession, SessionInfo};
use crate::utils::random_id;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// События для UI
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Connected { session_id: String },
    /// Транспорт сообщил о потере связи. Переподключения нет.
    ConnectionProblem(TransportState),
    Ended { session_id: Option<String> },
}

struct Inner {
    session: Option<PeerSession>,
    in_flight: bool,
    epoch: u64,
}

impl Inner {
    fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }
}

/// Захват шага переговоров. Пока он жив, другие шаги отклоняются.
struct Step<'a> {
    ctrl: &'a NegotiationController,
    epoch: u64,
    cancel: watch::Receiver<u64>,
    session_id: String,
    transport: Option<Arc<dyn PeerTransport>>,
}

impl Step<'_> {
    /// Завершается, когда звонок был завершён через `end_call`
    async fn cancelled(&mut self) {
        let epoch = self.epoch;
        let _ = self.cancel.wait_for(|e| *e != epoch).await;
    }

    fn transport(&self) -> SessionResult<Arc<dyn PeerTransport>> {
        self.transport
            .clone()
            .ok_or_else(|| SessionError::NoActiveSession("no transport".into()))
    }
}

impl Drop for Step<'_> {
    fn drop(&mut self) {
        let mut inner = self.ctrl.inner.lock();
        if inner.epoch == self.epoch {
            inner.in_flight = false;
        }
    }
}

fn ended() -> SessionError {
    SessionError::NoActiveSession("call was ended".into())
}

pub struct NegotiationController {
    media: MediaSession,
    transports: Arc<dyn TransportFactory>,
    inner: Mutex<Inner>,
    cancel_tx: watch::Sender<u64>,
    events: broadcast::Sender<SessionEvent>,
}

impl NegotiationController {
    pub fn new(devices: Arc<dyn MediaDevices>, transports: Arc<dyn TransportFactory>) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(0);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            media: MediaSession::new(devices),
            transports,
            inner: Mutex::new(Inner {
                session: None,
                in_flight: false,
                epoch: 0,
            }),
            cancel_tx,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state()
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.inner.lock().session.as_ref().map(SessionInfo::from)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.local_description.clone())
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.remote_description.clone())
    }

    pub fn media(&self) -> &MediaSession {
        &self.media
    }

    pub fn toggle_mic(&self) -> SessionResult<bool> {
        self.media.toggle_mic()
    }

    pub fn toggle_camera(&self) -> SessionResult<bool> {
        self.media.toggle_camera()
    }

    fn emit(&self, event: SessionEvent) {
        debug!("Session event: {event:?}");
        let _ = self.events.send(event);
    }

    /// Занимает машину состояний под один шаг, если она в состоянии `expected`
    fn begin(&self, expected: SessionState) -> SessionResult<Step<'_>> {
        let mut inner = self.inner.lock();
        if inner.in_flight {
            return Err(SessionError::NegotiationInProgress);
        }
        let state = inner.state();
        if state != expected {
            return Err(SessionError::NoActiveSession(state.to_string()));
        }
        let session = inner.session.as_ref().ok_or_else(ended)?;
        let session_id = session.id.clone();
        let transport = session.transport.clone();

        inner.in_flight = true;
        Ok(Step {
            ctrl: self,
            epoch: inner.epoch,
            cancel: self.cancel_tx.subscribe(),
            session_id,
            transport,
        })
    }

    /// Применяет изменение к сессии, если звонок не был завершён за время шага
    fn commit<R>(&self, step: &Step<'_>, f: impl FnOnce(&mut PeerSession) -> R) -> SessionResult<R> {
        let mut inner = self.inner.lock();
        if inner.epoch != step.epoch {
            return Err(ended());
        }
        let session = inner.session.as_mut().ok_or_else(ended)?;
        Ok(f(session))
    }

    fn set_state(&self, step: &Step<'_>, to: SessionState) -> SessionResult<()> {
        self.commit(step, |s| {
            debug_assert!(s.state.can_transition(to), "{} -> {}", s.state, to);
            s.state = to;
        })?;
        self.emit(SessionEvent::StateChanged(to));
        Ok(())
    }

    /// Idle -> CameraReady
    pub async fn start_capture(&self) -> SessionResult<()> {
        let epoch = {
            let mut inner = self.inner.lock();
            if inner.in_flight {
                return Err(SessionError::NegotiationInProgress);
            }
            if let Some(session) = &inner.session {
                return Err(SessionError::SessionAlreadyActive(session.state.to_string()));
            }
            inner.in_flight = true;
            inner.epoch
        };

        let captured = self.media.start_capture().await;

        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            // звонок завершили, пока ждали устройства; новый захват не трогаем
            drop(inner);
            if let Ok(tracks) = &captured {
                self.media.release(tracks);
            }
            return Err(ended());
        }
        inner.in_flight = false;
        let tracks = captured?;
        inner.session = Some(PeerSession::new(random_id(), tracks));
        drop(inner);

        info!("Camera ready");
        self.emit(SessionEvent::StateChanged(SessionState::CameraReady));
        Ok(())
    }

    /// Сторона A: CameraReady -> OfferCreated -> AwaitingAnswer.
    /// Возвращает описание только после завершения сбора кандидатов.
    pub async fn create_offer(self: &Arc<Self>) -> SessionResult<SessionDescription> {
        let mut step = self.begin(SessionState::CameraReady)?;
        let transport = self
            .transports
            .open(Role::Caller, &step.session_id)
            .await?;

        let gathering = match self.prepare_offer(&transport).await {
            Ok(gathering) => gathering,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let adopted = self.commit(&step, |s| {
            s.role = Some(Role::Caller);
            s.transport = Some(Arc::clone(&transport));
            s.state = SessionState::OfferCreated;
        });
        if let Err(e) = adopted {
            transport.close().await;
            return Err(e);
        }
        self.emit(SessionEvent::StateChanged(SessionState::OfferCreated));
        debug!("Offer created, waiting for ICE candidates...");

        let candidates = tokio::select! {
            result = gathering.wait() => result,
            _ = step.cancelled() => return Err(ended()),
        };
        let finalized = match candidates {
            Ok(candidates) => self.finalize(&step, &transport, DescriptionKind::Offer, candidates).await,
            Err(e) => Err(e),
        };

        let desc = match finalized {
            Ok(desc) => desc,
            Err(e) => {
                self.rollback(&step, SessionState::CameraReady).await;
                return Err(e);
            }
        };

        self.commit(&step, |s| s.local_description = Some(desc.clone()))?;
        self.set_state(&step, SessionState::AwaitingAnswer)?;
        self.watch_transport(step.epoch, transport);
        Ok(desc)
    }

    async fn prepare_offer(
        &self,
        transport: &Arc<dyn PeerTransport>,
    ) -> SessionResult<GatheringComplete> {
        transport.attach_tracks(&self.media.tracks()).await?;
        transport.create_offer().await
    }

    /// Сторона B: CameraReady -> OfferReceived.
    /// Неверный offer оставляет сессию в CameraReady.
    pub async fn accept_offer(&self, payload: &str) -> SessionResult<()> {
        let step = self.begin(SessionState::CameraReady)?;
        let remote = codec::decode(payload, DescriptionKind::Offer)
            .map_err(|e| SessionError::InvalidOffer(e.to_string()))?;
        info!("Decoded offer, session id: {}", remote.session_id);

        let transport = self
            .transports
            .open(Role::Receiver, &remote.session_id)
            .await?;
        if let Err(e) = transport.attach_tracks(&self.media.tracks()).await {
            transport.close().await;
            return Err(e);
        }
        if let Err(e) = transport.apply_remote(&remote).await {
            transport.close().await;
            return Err(SessionError::InvalidOffer(e.to_string()));
        }

        let adopted = self.commit(&step, |s| {
            s.id = remote.session_id.clone();
            s.role = Some(Role::Receiver);
            s.remote_description = Some(remote);
            s.transport = Some(Arc::clone(&transport));
        });
        if let Err(e) = adopted {
            transport.close().await;
            return Err(e);
        }
        self.set_state(&step, SessionState::OfferReceived)
    }

    /// Сторона B: OfferReceived -> AnswerCreated. Connected наступит,
    /// когда транспорт сообщит о связности.
    pub async fn create_answer(self: &Arc<Self>) -> SessionResult<SessionDescription> {
        let mut step = self.begin(SessionState::OfferReceived)?;
        let transport = step.transport()?;

        let gathering = transport.create_answer().await?;
        debug!("Answer created, waiting for ICE candidates...");

        let candidates = tokio::select! {
            result = gathering.wait() => result?,
            _ = step.cancelled() => return Err(ended()),
        };
        let desc = self
            .finalize(&step, &transport, DescriptionKind::Answer, candidates)
            .await?;

        self.commit(&step, |s| s.local_description = Some(desc.clone()))?;
        self.set_state(&step, SessionState::AnswerCreated)?;
        self.watch_transport(step.epoch, transport);
        Ok(desc)
    }

    /// Сторона A: AwaitingAnswer -> Connected.
    /// Неверный answer оставляет сессию в AwaitingAnswer, можно повторить.
    pub async fn set_remote_answer(&self, payload: &str) -> SessionResult<()> {
        let step = self.begin(SessionState::AwaitingAnswer)?;
        let transport = step.transport()?;

        let remote = codec::decode(payload, DescriptionKind::Answer)
            .map_err(|e| SessionError::InvalidAnswer(e.to_string()))?;
        transport
            .apply_remote(&remote)
            .await
            .map_err(|e| SessionError::InvalidAnswer(e.to_string()))?;

        self.commit(&step, |s| s.remote_description = Some(remote))?;
        self.set_state(&step, SessionState::Connected)?;
        info!("Remote answer applied, session {} connected", step.session_id);
        self.emit(SessionEvent::Connected {
            session_id: step.session_id.clone(),
        });
        Ok(())
    }

    /// Любое состояние -> Ended -> Idle. Освобождает медиа и транспорт ровно
    /// один раз; на пустой машине ничего не делает. Возвращает true, если
    /// было что завершать.
    pub async fn end_call(&self) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            if inner.session.is_none() && !inner.in_flight {
                return false;
            }
            inner.epoch += 1;
            inner.in_flight = false;
            self.cancel_tx.send_replace(inner.epoch);
            inner.session.take()
        };

        self.emit(SessionEvent::StateChanged(SessionState::Ended));
        let released = self.media.release_all();
        let session_id = session.as_ref().map(|s| s.id.clone());
        if let Some(transport) = session.and_then(|s| s.transport) {
            transport.close().await;
        }
        info!("Call ended, released {released} tracks");

        self.emit(SessionEvent::Ended { session_id });
        self.emit(SessionEvent::StateChanged(SessionState::Idle));
        true
    }

    /// Собирает итоговое описание: SDP уже содержит все кандидаты
    async fn finalize(
        &self,
        step: &Step<'_>,
        transport: &Arc<dyn PeerTransport>,
        kind: DescriptionKind,
        candidates: Vec<IceCandidate>,
    ) -> SessionResult<SessionDescription> {
        let sdp = transport.local_sdp().await?;
        let role = kind.sender_role();
        info!("Collected {} ICE candidates for {kind}", candidates.len());
        Ok(SessionDescription {
            kind,
            role,
            session_id: step.session_id.clone(),
            sdp,
            media: self.media.summary(),
            candidates,
            ts: chrono::Utc::now().timestamp(),
        })
    }

    /// Откат после сбоя транспорта: соединение закрывается, роль сбрасывается
    async fn rollback(&self, step: &Step<'_>, to: SessionState) {
        let transport = self
            .commit(step, |s| {
                s.role = None;
                s.state = to;
                s.transport.take()
            })
            .ok()
            .flatten();
        if let Some(transport) = transport {
            warn!("Negotiation step failed, rolling back to {to}");
            transport.close().await;
            self.emit(SessionEvent::StateChanged(to));
        }
    }

    fn on_transport_connected(&self, epoch: u64) {
        let session_id = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            match inner.session.as_mut() {
                Some(s) if s.state == SessionState::AnswerCreated => {
                    s.state = SessionState::Connected;
                    s.id.clone()
                }
                _ => return,
            }
        };
        info!("Transport connected, session {session_id} connected");
        self.emit(SessionEvent::StateChanged(SessionState::Connected));
        self.emit(SessionEvent::Connected { session_id });
    }

    /// Следит за связностью транспорта до конца звонка
    fn watch_transport(self: &Arc<Self>, epoch: u64, transport: Arc<dyn PeerTransport>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = transport.state();
        tokio::spawn(async move {
            loop {
                let state = *rx.borrow_and_update();
                let Some(ctrl) = weak.upgrade() else { break };
                if ctrl.inner.lock().epoch != epoch {
                    break;
                }
                match state {
                    TransportState::Connected => ctrl.on_transport_connected(epoch),
                    TransportState::Disconnected | TransportState::Failed => {
                        warn!("Transport reported {state:?}");
                        ctrl.emit(SessionEvent::ConnectionProblem(state));
                    }
                    TransportState::Closed => break,
                    TransportState::New | TransportState::Connecting => {}
                }
                drop(ctrl);
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::peer::media::tests::CountingDevices;
    use crate::peer::media::{LocalTrack, SyntheticDevices};
    use crate::peer::types::{MediaSummary, TrackKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    /// Транспорт без сети: сбор кандидатов завершается по команде теста
    pub(crate) struct FakeTransport {
        pub gate: Option<Arc<Notify>>,
        pub state_tx: watch::Sender<TransportState>,
        pub closed: AtomicUsize,
        pub local: Mutex<Option<String>>,
    }

    impl FakeTransport {
        fn new(gate: Option<Arc<Notify>>) -> Self {
            let (state_tx, _) = watch::channel(TransportState::New);
            Self {
                gate,
                state_tx,
                closed: AtomicUsize::new(0),
                local: Mutex::new(None),
            }
        }

        fn gather(&self, sdp: &str) -> GatheringComplete {
            *self.local.lock() = Some(sdp.to_owned());
            let candidates = vec![IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }];
            match &self.gate {
                None => GatheringComplete::ready(candidates),
                Some(gate) => {
                    let (tx, done) = GatheringComplete::channel();
                    let gate = Arc::clone(gate);
                    tokio::spawn(async move {
                        gate.notified().await;
                        let _ = tx.send(candidates);
                    });
                    done
                }
            }
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn attach_tracks(&self, _tracks: &[Arc<LocalTrack>]) -> SessionResult<()> {
            Ok(())
        }

        async fn create_offer(&self) -> SessionResult<GatheringComplete> {
            Ok(self.gather("v=0\r\ns=fake-offer\r\n"))
        }

        async fn create_answer(&self) -> SessionResult<GatheringComplete> {
            Ok(self.gather("v=0\r\ns=fake-answer\r\n"))
        }

        async fn apply_remote(&self, desc: &SessionDescription) -> SessionResult<()> {
            if desc.sdp.contains("reject-me") {
                return Err(SessionError::Transport("sdp parse failure".into()));
            }
            Ok(())
        }

        async fn local_sdp(&self) -> SessionResult<String> {
            self.local
                .lock()
                .clone()
                .ok_or_else(|| SessionError::Transport("no local description".into()))
        }

        fn state(&self) -> watch::Receiver<TransportState> {
            self.state_tx.subscribe()
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            self.state_tx.send_replace(TransportState::Closed);
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeFactory {
        pub gate: Option<Arc<Notify>>,
        pub opened: Mutex<Vec<Arc<FakeTransport>>>,
    }

    impl FakeFactory {
        pub fn last(&self) -> Arc<FakeTransport> {
            self.opened.lock().last().cloned().expect("no transport opened")
        }
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn open(&self, _role: Role, _session_id: &str) -> SessionResult<Arc<dyn PeerTransport>> {
            let transport = Arc::new(FakeTransport::new(self.gate.clone()));
            self.opened.lock().push(Arc::clone(&transport));
            Ok(transport)
        }
    }

    pub(crate) fn controller() -> (Arc<NegotiationController>, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        (
            NegotiationController::new(Arc::new(SyntheticDevices), factory.clone()),
            factory,
        )
    }

    fn answer_payload(session_id: &str, sdp: &str) -> String {
        payload(DescriptionKind::Answer, Role::Receiver, session_id, sdp)
    }

    fn offer_payload(session_id: &str, sdp: &str) -> String {
        payload(DescriptionKind::Offer, Role::Caller, session_id, sdp)
    }

    fn payload(kind: DescriptionKind, role: Role, session_id: &str, sdp: &str) -> String {
        codec::encode(&SessionDescription {
            kind,
            role,
            session_id: session_id.into(),
            sdp: sdp.into(),
            media: MediaSummary {
                audio: true,
                video: true,
            },
            candidates: vec![],
            ts: 0,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn caller_reaches_connected_after_valid_answer() {
        let (ctrl, _) = controller();
        assert_ok!(ctrl.start_capture().await);
        assert_eq!(ctrl.state(), SessionState::CameraReady);

        let offer = ctrl.create_offer().await.unwrap();
        assert_eq!(offer.kind, DescriptionKind::Offer);
        assert_eq!(offer.candidates.len(), 1);
        assert!(offer.media.audio && offer.media.video);
        assert_eq!(ctrl.state(), SessionState::AwaitingAnswer);

        let answer = answer_payload(&offer.session_id, "v=0\r\ns=answer\r\n");
        assert_ok!(ctrl.set_remote_answer(&answer).await);
        assert_eq!(ctrl.state(), SessionState::Connected);
        assert!(ctrl.remote_description().is_some());
    }

    #[tokio::test]
    async fn malformed_answer_keeps_awaiting_answer() {
        let (ctrl, _) = controller();
        ctrl.start_capture().await.unwrap();
        let offer = ctrl.create_offer().await.unwrap();

        let err = ctrl.set_remote_answer("{ not json").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidAnswer(_)));
        assert_eq!(ctrl.state(), SessionState::AwaitingAnswer);

        // SDP, который транспорт не принял, тоже не меняет состояние
        let bad = answer_payload(&offer.session_id, "v=0\r\ns=reject-me\r\n");
        let err = ctrl.set_remote_answer(&bad).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidAnswer(_)));
        assert_eq!(ctrl.state(), SessionState::AwaitingAnswer);

        // повтор с корректным answer проходит
        let good = answer_payload(&offer.session_id, "v=0\r\ns=answer\r\n");
        assert_ok!(ctrl.set_remote_answer(&good).await);
        assert_eq!(ctrl.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn answer_without_offer_is_rejected() {
        let (ctrl, _) = controller();
        ctrl.start_capture().await.unwrap();
        let answer = answer_payload("x", "v=0\r\n");
        let err = ctrl.set_remote_answer(&answer).await.unwrap_err();
        assert!(matches!(err, SessionError::NoActiveSession(_)));
        assert_eq!(ctrl.state(), SessionState::CameraReady);
    }

    #[tokio::test]
    async fn offer_requires_camera() {
        let (ctrl, factory) = controller();
        let err = ctrl.create_offer().await.unwrap_err();
        assert!(matches!(err, SessionError::NoActiveSession(_)));
        assert!(factory.opened.lock().is_empty());
    }

    #[tokio::test]
    async fn unparsable_offer_keeps_camera_ready() {
        let (ctrl, factory) = controller();
        ctrl.start_capture().await.unwrap();

        let err = ctrl.accept_offer("%%% definitely not an offer").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidOffer(_)));
        assert_eq!(ctrl.state(), SessionState::CameraReady);
        assert!(factory.opened.lock().is_empty());

        // answer вместо offer тоже отклоняется
        let err = ctrl
            .accept_offer(&answer_payload("x", "v=0\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidOffer(_)));
        assert_eq!(ctrl.state(), SessionState::CameraReady);
    }

    #[tokio::test]
    async fn rejected_offer_sdp_closes_transport_and_keeps_camera_ready() {
        let (ctrl, factory) = controller();
        ctrl.start_capture().await.unwrap();

        let offer = offer_payload("remote-1", "v=0\r\ns=reject-me\r\n");
        let err = ctrl.accept_offer(&offer).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidOffer(_)));
        assert_eq!(ctrl.state(), SessionState::CameraReady);
        assert_eq!(factory.last().closed.load(Ordering::SeqCst), 1);

        let session = ctrl.session().unwrap();
        assert_ne!(session.id, "remote-1");
        assert!(ctrl.remote_description().is_none());

        // после отказа корректный offer принимается
        assert_ok!(ctrl.accept_offer(&offer_payload("remote-1", "v=0\r\n")).await);
        assert_eq!(ctrl.state(), SessionState::OfferReceived);
    }

    #[tokio::test]
    async fn receiver_connects_once_on_transport_connectivity() {
        let (caller, _) = controller();
        let (receiver, factory) = controller();
        let mut events = receiver.subscribe();

        caller.start_capture().await.unwrap();
        receiver.start_capture().await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        receiver
            .accept_offer(&codec::encode_compact(&offer).unwrap())
            .await
            .unwrap();
        assert_eq!(receiver.state(), SessionState::OfferReceived);
        assert_eq!(receiver.session().unwrap().id, offer.session_id);

        let answer = receiver.create_answer().await.unwrap();
        assert_eq!(answer.session_id, offer.session_id);
        assert_eq!(receiver.state(), SessionState::AnswerCreated);

        caller
            .set_remote_answer(&codec::encode(&answer).unwrap())
            .await
            .unwrap();
        assert_eq!(caller.state(), SessionState::Connected);

        let transport = factory.last();
        transport.state_tx.send_replace(TransportState::Connected);
        let mut connected = 0;
        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(1), events.recv()).await {
                Ok(Ok(SessionEvent::Connected { .. })) => {
                    connected += 1;
                    // повторный сигнал не должен дать второго Connected
                    transport.state_tx.send_replace(TransportState::Connecting);
                    transport.state_tx.send_replace(TransportState::Connected);
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert_eq!(connected, 1);
        assert_eq!(receiver.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn end_call_twice_releases_once() {
        let devices = Arc::new(CountingDevices::default());
        let factory = Arc::new(FakeFactory::default());
        let ctrl = NegotiationController::new(devices.clone(), factory.clone());

        ctrl.start_capture().await.unwrap();
        ctrl.create_offer().await.unwrap();

        assert!(ctrl.end_call().await);
        assert_eq!(ctrl.state(), SessionState::Idle);
        assert_eq!(devices.closed.load(Ordering::SeqCst), 2);
        assert_eq!(factory.last().closed.load(Ordering::SeqCst), 1);

        assert!(!ctrl.end_call().await);
        assert_eq!(devices.closed.load(Ordering::SeqCst), 2);
        assert_eq!(factory.last().closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_step_in_flight_is_rejected_and_end_call_cancels() {
        let gate = Arc::new(Notify::new());
        let devices = Arc::new(CountingDevices::default());
        let factory = Arc::new(FakeFactory {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let ctrl = NegotiationController::new(devices.clone(), factory.clone());
        ctrl.start_capture().await.unwrap();

        let pending = tokio::spawn({
            let ctrl = Arc::clone(&ctrl);
            async move { ctrl.create_offer().await }
        });
        while ctrl.state() != SessionState::OfferCreated {
            tokio::task::yield_now().await;
        }

        let err = ctrl.create_offer().await.unwrap_err();
        assert!(matches!(err, SessionError::NegotiationInProgress));
        let err = ctrl.set_remote_answer("{}").await.unwrap_err();
        assert!(matches!(err, SessionError::NegotiationInProgress));

        assert!(ctrl.end_call().await);
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SessionError::NoActiveSession(_))));

        // сбор завершается уже после отмены: ничего не должно измениться
        gate.notify_one();
        tokio::task::yield_now().await;
        assert_eq!(ctrl.state(), SessionState::Idle);
        assert_eq!(devices.closed.load(Ordering::SeqCst), 2);
        assert_eq!(factory.last().closed.load(Ordering::SeqCst), 1);

        // новый звонок после завершения разрешён
        assert_ok!(ctrl.start_capture().await);
    }

    #[tokio::test]
    async fn capture_twice_is_rejected() {
        let (ctrl, _) = controller();
        ctrl.start_capture().await.unwrap();
        let err = assert_err!(ctrl.start_capture().await);
        assert!(matches!(err, SessionError::SessionAlreadyActive(_)));
    }

    #[tokio::test]
    async fn denied_device_keeps_idle() {
        let devices = Arc::new(CountingDevices {
            deny: Some(TrackKind::Audio),
            ..Default::default()
        });
        let ctrl = NegotiationController::new(devices, Arc::new(FakeFactory::default()));
        let err = ctrl.start_capture().await.unwrap_err();
        assert!(matches!(err, SessionError::MediaAccess(_)));
        assert_eq!(ctrl.state(), SessionState::Idle);
        // после отказа можно попробовать снова
        assert!(matches!(
            ctrl.start_capture().await,
            Err(SessionError::MediaAccess(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_capture_leaves_the_next_one_alone() {
        let gate = Arc::new(Notify::new());
        let devices = Arc::new(CountingDevices {
            gate: Mutex::new(Some(gate.clone())),
            ..Default::default()
        });
        let ctrl = NegotiationController::new(devices.clone(), Arc::new(FakeFactory::default()));

        let stale = tokio::spawn({
            let ctrl = Arc::clone(&ctrl);
            async move { ctrl.start_capture().await }
        });
        // первый захват ждёт микрофон
        while devices.gate.lock().is_some() {
            tokio::task::yield_now().await;
        }

        assert!(ctrl.end_call().await);
        assert_ok!(ctrl.start_capture().await);
        assert_eq!(ctrl.state(), SessionState::CameraReady);

        gate.notify_one();
        assert!(stale.await.unwrap().is_err());

        assert_eq!(ctrl.state(), SessionState::CameraReady);
        assert!(ctrl.media().is_capturing());
        assert_eq!(ctrl.media().tracks().len(), 2);
        assert_ok!(ctrl.toggle_mic());
        // закрыты только устройства отменённого захвата
        assert_eq!(devices.closed.load(Ordering::SeqCst), 2);
    }
}
