//! Захват локальных устройств.
//!
//! `CaptureBackend` открывает источник семплов на каждый трек; `LocalStream`
//! владеет захватом и останавливает его ровно один раз.

use crate::error::MediaError;
use crate::peer::types::{MediaKind, StreamInfo, TrackKind};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use webrtc::media::Sample;

/// Источник закодированных семплов одного трека
#[async_trait]
pub trait SampleSource: Send {
    /// None означает, что устройство закрылось
    async fn next_sample(&mut self) -> Option<Sample>;
}

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(&self, track: TrackKind) -> Result<Box<dyn SampleSource>, MediaError>;
}

type Stopper = Box<dyn FnOnce() + Send + Sync>;

/// Локальный захват, которым владеет сессия
pub struct LocalStream {
    info: StreamInfo,
    media_kind: MediaKind,
    stopper: Option<Stopper>,
}

impl LocalStream {
    pub fn new(media_kind: MediaKind, stopper: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            info: StreamInfo {
                id: random_id(),
                tracks: media_kind.tracks().to_vec(),
            },
            media_kind,
            stopper: Some(Box::new(stopper)),
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    pub fn is_live(&self) -> bool {
        self.stopper.is_some()
    }

    /// Останавливает все треки. Возвращает false, если уже остановлены.
    pub fn release(&mut self) -> bool {
        match self.stopper.take() {
            Some(stop) => {
                stop();
                true
            }
            None => false,
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("info", &self.info)
            .field("live", &self.is_live())
            .finish()
    }
}

// Opus DTX silence frame
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);

/// Захват без устройств: тишина в аудио и пустые кадры в видео.
/// Для headless-узлов и проверок связи.
#[derive(Debug, Default, Clone)]
pub struct SilentCapture;

struct SilentSource {
    track: TrackKind,
    ticker: Interval,
}

#[async_trait]
impl SampleSource for SilentSource {
    async fn next_sample(&mut self) -> Option<Sample> {
        self.ticker.tick().await;
        let (data, duration) = match self.track {
            TrackKind::Audio => (Bytes::from_static(&OPUS_SILENCE), AUDIO_FRAME),
            TrackKind::Video => (Bytes::from_static(&[0u8; 10]), VIDEO_FRAME),
        };
        Some(Sample {
            data,
            duration,
            ..Default::default()
        })
    }
}

#[async_trait]
impl CaptureBackend for SilentCapture {
    async fn open(&self, track: TrackKind) -> Result<Box<dyn SampleSource>, MediaError> {
        let period = match track {
            TrackKind::Audio => AUDIO_FRAME,
            TrackKind::Video => VIDEO_FRAME,
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Ok(Box::new(SilentSource { track, ticker }))
    }
}
