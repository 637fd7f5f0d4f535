use crate::error::{SessionError, SessionResult};
use crate::peer::types::{MediaSummary, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const STREAM_ID: &str = "peerlink-local";

/// Открытое устройство захвата
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub label: String,
    pub kind: TrackKind,
}

/// Доступ к устройствам захвата. Может ждать разрешения пользователя.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, kind: TrackKind) -> SessionResult<DeviceHandle>;
    fn close(&self, device: &DeviceHandle);
}

/// Устройства без реального железа: доступ выдаётся всегда,
/// кадры приложение подаёт само через `MediaSession::write_sample`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticDevices;

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(&self, kind: TrackKind) -> SessionResult<DeviceHandle> {
        let label = match kind {
            TrackKind::Audio => "synthetic-microphone",
            TrackKind::Video => "synthetic-camera",
        };
        Ok(DeviceHandle {
            id: crate::utils::random_id(),
            label: label.into(),
            kind,
        })
    }

    fn close(&self, device: &DeviceHandle) {
        debug!("Closing synthetic device {}", device.label);
    }
}

/// Локальный трек: устройство + включён/выключен + RTP-трек для peer connection
#[derive(Debug)]
pub struct LocalTrack {
    pub kind: TrackKind,
    pub device: DeviceHandle,
    enabled: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    fn new(device: DeviceHandle) -> Self {
        let (mime_type, track_id) = match device.kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, "audio"),
            TrackKind::Video => (MIME_TYPE_VP8, "video"),
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track_id.to_owned(),
            STREAM_ID.to_owned(),
        ));
        Self {
            kind: device.kind,
            device,
            enabled: AtomicBool::new(true),
            rtp,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn flip(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }
}

/// Набор локальных треков, полученных при захвате
pub struct LocalMediaCapture {
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMediaCapture {
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn summary(&self) -> MediaSummary {
        MediaSummary {
            audio: self.tracks.iter().any(|t| t.kind == TrackKind::Audio),
            video: self.tracks.iter().any(|t| t.kind == TrackKind::Video),
        }
    }
}

/// Менеджер локального захвата
pub struct MediaSession {
    devices: Arc<dyn MediaDevices>,
    capture: Mutex<Option<LocalMediaCapture>>,
}

impl MediaSession {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            capture: Mutex::new(None),
        }
    }

    /// Захват микрофона и камеры. Если второе устройство недоступно,
    /// первое закрывается обратно.
    pub async fn start_capture(&self) -> SessionResult<Vec<Arc<LocalTrack>>> {
        if self.is_capturing() {
            return Err(SessionError::SessionAlreadyActive(
                "capture already running".into(),
            ));
        }

        let audio = self.devices.open(TrackKind::Audio).await?;
        let video = match self.devices.open(TrackKind::Video).await {
            Ok(video) => video,
            Err(e) => {
                self.devices.close(&audio);
                return Err(e);
            }
        };

        let tracks = vec![
            Arc::new(LocalTrack::new(audio)),
            Arc::new(LocalTrack::new(video)),
        ];
        info!("Capture started with {} tracks", tracks.len());

        let mut capture = self.capture.lock();
        if capture.is_some() {
            // параллельный захват успел раньше
            drop(capture);
            for track in &tracks {
                self.devices.close(&track.device);
            }
            return Err(SessionError::SessionAlreadyActive(
                "capture already running".into(),
            ));
        }
        *capture = Some(LocalMediaCapture {
            tracks: tracks.clone(),
        });
        Ok(tracks)
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.lock().is_some()
    }

    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.capture
            .lock()
            .as_ref()
            .map(|c| c.tracks().to_vec())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> MediaSummary {
        self.capture
            .lock()
            .as_ref()
            .map(LocalMediaCapture::summary)
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.capture
            .lock()
            .as_ref()?
            .tracks()
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.is_enabled())
    }

    pub fn toggle_mic(&self) -> SessionResult<bool> {
        self.toggle(TrackKind::Audio)
    }

    pub fn toggle_camera(&self) -> SessionResult<bool> {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> SessionResult<bool> {
        let capture = self.capture.lock();
        let capture = capture
            .as_ref()
            .ok_or_else(|| SessionError::NoActiveSession("no local capture".into()))?;

        let mut result = None;
        for track in capture.tracks().iter().filter(|t| t.kind == kind) {
            let now = track.flip();
            result.get_or_insert(now);
        }
        let enabled = result.ok_or_else(|| {
            SessionError::MediaAccess(format!("no {kind:?} track captured"))
        })?;
        debug!("{kind:?} tracks enabled={enabled}");
        Ok(enabled)
    }

    /// Подаёт закодированный кадр в трек. Для выключенного трека кадр
    /// отбрасывается, устройство при этом продолжает работать.
    pub async fn write_sample(
        &self,
        kind: TrackKind,
        data: Bytes,
        duration: Duration,
    ) -> SessionResult<bool> {
        let track = self
            .tracks()
            .into_iter()
            .find(|t| t.kind == kind)
            .ok_or_else(|| SessionError::NoActiveSession("no local capture".into()))?;

        if !track.is_enabled() {
            return Ok(false);
        }

        track
            .rtp
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }

    /// Останавливает все треки и закрывает устройства. Повторный вызов
    /// ничего не освобождает и возвращает 0.
    pub fn release_all(&self) -> usize {
        let Some(capture) = self.capture.lock().take() else {
            return 0;
        };
        self.close_capture(capture)
    }

    /// Освобождает захват, только если установлен именно он. Захват,
    /// начатый позже, остаётся нетронутым.
    pub fn release(&self, tracks: &[Arc<LocalTrack>]) -> usize {
        let capture = {
            let mut current = self.capture.lock();
            let owned = current.as_ref().is_some_and(|c| {
                c.tracks().len() == tracks.len()
                    && c.tracks().iter().zip(tracks).all(|(a, b)| Arc::ptr_eq(a, b))
            });
            if !owned {
                debug!("Capture was replaced, nothing to release");
                return 0;
            }
            current.take()
        };
        capture.map(|c| self.close_capture(c)).unwrap_or(0)
    }

    fn close_capture(&self, capture: LocalMediaCapture) -> usize {
        for track in capture.tracks() {
            track.enabled.store(false, Ordering::SeqCst);
            self.devices.close(&track.device);
        }
        let released = capture.tracks().len();
        if released == 0 {
            warn!("Released a capture without tracks");
        }
        info!("Released {released} local tracks");
        released
    }
}
