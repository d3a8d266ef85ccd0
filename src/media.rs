//! Local capture: device handles, track ownership and mute toggles.

use crate::errors::DeviceError;
use crate::peer::types::{MediaTrack, TrackKind};
use crate::utils::random_id;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Open capture pipeline for one track kind. Dropping it must not leak the device.
pub trait DeviceHandle: Send {
    /// Mutes or blanks the output without closing the device.
    fn set_enabled(&mut self, enabled: bool);

    fn stop(&mut self);
}

/// Source of device handles (camera/microphone stack, or something synthetic).
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Opens the device for `track.kind()`. Encoded output goes to
    /// [`MediaTrack::push_sample`] on `track`.
    async fn open(&self, track: &MediaTrack) -> Result<Box<dyn DeviceHandle>, DeviceError>;
}

struct LocalTrack {
    track: MediaTrack,
    handle: Box<dyn DeviceHandle>,
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        log::debug!("stopping {} track {}", self.track.kind(), self.track.id());
        self.handle.stop();
    }
}

/// Owns local capture tracks from `acquire` until `release`.
pub struct MediaSource {
    backend: Arc<dyn CaptureBackend>,
    tracks: Mutex<Vec<LocalTrack>>,
}

impl MediaSource {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            tracks: Mutex::new(Vec::new()),
        }
    }

    /// Opens an audio track and, if asked, a video track.
    ///
    /// Handles opened before a failure (or before the future is dropped) are
    /// stopped on the way out; nothing is kept unless every open succeeds.
    pub async fn acquire(&self, want_video: bool) -> Result<Vec<MediaTrack>, DeviceError> {
        if self.is_acquired() {
            return Err(DeviceError::Busy("capture already held by this source".into()));
        }

        let mut kinds = vec![TrackKind::Audio];
        if want_video {
            kinds.push(TrackKind::Video);
        }

        let mut opened = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let track = MediaTrack::local(format!("{kind}-{}", random_id()), kind);
            let handle = self.backend.open(&track).await?;
            opened.push(LocalTrack { track, handle });
        }

        let mut tracks = self.tracks.lock().unwrap_or_else(|p| p.into_inner());
        if !tracks.is_empty() {
            // lost a race with another acquire; `opened` drops and stops here
            return Err(DeviceError::Busy("capture already held by this source".into()));
        }
        let out = opened.iter().map(|t| t.track.clone()).collect();
        *tracks = opened;
        log::info!("acquired {} local track(s)", tracks.len());
        Ok(out)
    }

    /// Returns false when no track of `kind` is held.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut tracks = self.tracks.lock().unwrap_or_else(|p| p.into_inner());
        match tracks.iter_mut().find(|t| t.track.kind() == kind) {
            Some(t) => {
                t.handle.set_enabled(enabled);
                t.track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        let tracks = self.tracks.lock().unwrap_or_else(|p| p.into_inner());
        tracks
            .iter()
            .find(|t| t.track.kind() == kind)
            .map(|t| t.track.is_enabled())
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        let tracks = self.tracks.lock().unwrap_or_else(|p| p.into_inner());
        tracks.iter().map(|t| t.track.clone()).collect()
    }

    pub fn is_acquired(&self) -> bool {
        !self.tracks.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }

    /// Stops every handle. Returns whether anything was held.
    pub fn release(&self) -> bool {
        let released: Vec<LocalTrack> = {
            let mut tracks = self.tracks.lock().unwrap_or_else(|p| p.into_inner());
            tracks.drain(..).collect()
        };
        let any = !released.is_empty();
        drop(released);
        if any {
            log::info!("released local capture");
        }
        any
    }
}

/// Releases the source when dropped, on every exit path.
pub struct MediaLease {
    media: Arc<MediaSource>,
    tracks: Vec<MediaTrack>,
}

impl MediaLease {
    pub async fn acquire(media: Arc<MediaSource>, want_video: bool) -> Result<Self, DeviceError> {
        let tracks = media.acquire(want_video).await?;
        Ok(Self { media, tracks })
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }
}

impl Drop for MediaLease {
    fn drop(&mut self) {
        self.media.release();
    }
}

/// Counters shared by every handle a [`SyntheticCapture`] hands out.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub opened: AtomicUsize,
    pub stopped: AtomicUsize,
    pub toggles: AtomicUsize,
}

/// Headless backend with no hardware behind it.
///
/// Holds devices exclusively like real hardware would: a kind that is open
/// cannot be opened again until its handle is stopped.
#[derive(Default)]
pub struct SyntheticCapture {
    stats: Arc<CaptureStats>,
    held: Arc<Mutex<Vec<TrackKind>>>,
    fail_with: Mutex<Option<(TrackKind, DeviceError)>>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    /// Makes every later open of `kind` fail with `err`.
    pub fn fail_on(&self, kind: TrackKind, err: DeviceError) {
        *self.fail_with.lock().unwrap_or_else(|p| p.into_inner()) = Some((kind, err));
    }

    pub fn clear_failure(&self) {
        *self.fail_with.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn open_handles(&self) -> usize {
        self.held.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn open(&self, track: &MediaTrack) -> Result<Box<dyn DeviceHandle>, DeviceError> {
        let kind = track.kind();
        let failure = self
            .fail_with
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some((k, err)) = failure {
            if k == kind {
                return Err(err);
            }
        }
        tokio::task::yield_now().await;

        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if held.contains(&kind) {
            return Err(DeviceError::Busy(format!("{kind} device is held elsewhere")));
        }
        held.push(kind);
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticHandle {
            kind,
            stats: self.stats.clone(),
            held: self.held.clone(),
            stopped: false,
        }))
    }
}

struct SyntheticHandle {
    kind: TrackKind,
    stats: Arc<CaptureStats>,
    held: Arc<Mutex<Vec<TrackKind>>>,
    stopped: bool,
}

impl DeviceHandle for SyntheticHandle {
    fn set_enabled(&mut self, enabled: bool) {
        log::trace!("synthetic {} capture enabled={enabled}", self.kind);
        self.stats.toggles.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|k| *k != self.kind);
        self.stats.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for SyntheticHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
