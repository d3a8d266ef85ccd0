//! Capture from the machine's microphone and camera.
//!
//! Audio comes from `cpal` and is encoded to Opus with libopus; video comes
//! from `nokhwa` and is encoded to H.264 with openh264. Each device runs on
//! its own thread and pushes encoded samples into the track it was opened
//! for. Built with the `devices` feature.

use crate::config::MediaConfig;
use crate::errors::DeviceError;
use crate::media::{CaptureBackend, DeviceHandle};
use crate::peer::types::{MediaSample, MediaTrack, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use openh264::encoder::Encoder;
use openh264::formats::YUVBuffer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

/// Opus only runs at 48 kHz.
const SAMPLE_RATE: u32 = 48_000;

/// 20 ms of mono audio at 48 kHz.
const OPUS_FRAME_SAMPLES: usize = 960;
const OPUS_FRAME: Duration = Duration::from_millis(20);

/// OPUS_APPLICATION_VOIP in opus.h.
const OPUS_APPLICATION_VOIP: i32 = 2048;
const OPUS_BITRATE: i32 = 32_000;
const MAX_OPUS_PACKET: usize = 4000;

/// PCM chunks buffered between the audio callback and the encoder thread.
const MAX_PCM_BACKLOG: usize = 64;

/// How often capture threads look at their stop flag.
const POLL: Duration = Duration::from_millis(100);

type Ready = std_mpsc::SyncSender<Result<(), DeviceError>>;

/// Opens the configured microphone and camera.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapture {
    microphone: Option<String>,
    camera: u32,
}

impl DeviceCapture {
    /// Default microphone, first camera.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self {
            microphone: config.microphone.clone(),
            camera: config.camera,
        }
    }
}

#[async_trait]
impl CaptureBackend for DeviceCapture {
    async fn open(&self, track: &MediaTrack) -> Result<Box<dyn DeviceHandle>, DeviceError> {
        let track = track.clone();
        let microphone = self.microphone.clone();
        let camera = self.camera;
        // opening a device blocks until the driver answers
        let opened = tokio::task::spawn_blocking(move || match track.kind() {
            TrackKind::Audio => spawn_capture(TrackKind::Audio, move |ready, running, enabled| {
                run_microphone(microphone, track, ready, running, enabled)
            }),
            TrackKind::Video => spawn_capture(TrackKind::Video, move |ready, running, enabled| {
                run_camera(camera, track, ready, running, enabled)
            }),
        })
        .await
        .map_err(|e| DeviceError::Unavailable(format!("capture setup aborted: {e}")))?;
        Ok(Box::new(opened?))
    }
}

/// One capture thread feeding one track.
struct CaptureThread {
    kind: TrackKind,
    running: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceHandle for CaptureThread {
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("{} capture thread panicked", self.kind);
            } else {
                log::debug!("{} capture stopped", self.kind);
            }
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts `body` on a named thread and waits until it reports whether the
/// device opened.
fn spawn_capture<F>(kind: TrackKind, body: F) -> Result<CaptureThread, DeviceError>
where
    F: FnOnce(Ready, Arc<AtomicBool>, Arc<AtomicBool>) + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let enabled = Arc::new(AtomicBool::new(true));
    let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

    let thread = {
        let running = running.clone();
        let enabled = enabled.clone();
        std::thread::Builder::new()
            .name(format!("peercall-{kind}"))
            .spawn(move || body(ready_tx, running, enabled))
            .map_err(|e| DeviceError::Unavailable(format!("{kind} thread: {e}")))?
    };

    let mut handle = CaptureThread {
        kind,
        running,
        enabled,
        thread: Some(thread),
    };
    match ready_rx.recv() {
        Ok(Ok(())) => {
            log::info!("{kind} capture started");
            Ok(handle)
        }
        Ok(Err(e)) => {
            handle.stop();
            Err(e)
        }
        Err(_) => {
            handle.stop();
            Err(DeviceError::Unavailable(format!("{kind} capture thread exited early")))
        }
    }
}

fn run_microphone(
    name: Option<String>,
    track: MediaTrack,
    ready: Ready,
    running: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
) {
    let opened = open_microphone(name.as_deref()).and_then(|(stream, pcm)| {
        let encoder = OpusFrames::new()?;
        Ok((stream, pcm, encoder))
    });
    let (stream, pcm, mut encoder) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while running.load(Ordering::SeqCst) {
        let chunk = match pcm.recv_timeout(POLL) {
            Ok(chunk) => chunk,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        if !enabled.load(Ordering::SeqCst) {
            // muted: keep the stream warm, send nothing
            encoder.clear();
            continue;
        }
        for sample in encoder.push(&chunk) {
            track.push_sample(sample);
        }
    }
    if let Err(e) = stream.pause() {
        log::debug!("pausing microphone: {e}");
    }
}

fn open_microphone(
    name: Option<&str>,
) -> Result<(cpal::Stream, crossbeam_channel::Receiver<Vec<f32>>), DeviceError> {
    let host = cpal::default_host();
    let device = match name {
        None => host
            .default_input_device()
            .ok_or_else(|| DeviceError::Unavailable("no default microphone".into()))?,
        Some(name) => host
            .input_devices()
            .map_err(|e| DeviceError::from_os_message("microphone", &e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| DeviceError::Unavailable(format!("microphone {name} not found")))?,
    };

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    // a slow encoder loses the newest chunks, memory stays bounded
    let (tx, rx) = crossbeam_channel::bounded(MAX_PCM_BACKLOG);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = tx.try_send(data.to_vec());
            },
            |err| log::error!("microphone stream error: {err}"),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                DeviceError::Unavailable("microphone went away".into())
            }
            other => DeviceError::from_os_message("microphone", &other.to_string()),
        })?;
    stream
        .play()
        .map_err(|e| DeviceError::from_os_message("microphone", &e.to_string()))?;
    Ok((stream, rx))
}

/// Mono 48 kHz PCM in, 20 ms Opus packets out.
struct OpusFrames {
    encoder: *mut libopus_sys::OpusEncoder,
    pcm: Vec<f32>,
}

impl OpusFrames {
    fn new() -> Result<Self, DeviceError> {
        let mut error: i32 = 0;
        // SAFETY: constant arguments; the returned pointer is checked before use
        let encoder = unsafe {
            libopus_sys::opus_encoder_create(
                SAMPLE_RATE as i32,
                1,
                OPUS_APPLICATION_VOIP,
                &mut error,
            )
        };
        if encoder.is_null() || error != 0 {
            return Err(DeviceError::Unavailable(format!(
                "opus encoder init failed: {error}"
            )));
        }
        // SAFETY: `encoder` is a live encoder created above
        let res = unsafe {
            libopus_sys::opus_encoder_ctl(
                encoder,
                libopus_sys::OPUS_SET_BITRATE_REQUEST as i32,
                OPUS_BITRATE,
            )
        };
        if res != 0 {
            log::warn!("opus bitrate not applied: {res}");
        }
        Ok(Self {
            encoder,
            pcm: Vec::with_capacity(OPUS_FRAME_SAMPLES * 2),
        })
    }

    fn push(&mut self, pcm: &[f32]) -> Vec<MediaSample> {
        self.pcm.extend_from_slice(pcm);
        let mut out = Vec::new();
        while self.pcm.len() >= OPUS_FRAME_SAMPLES {
            let frame: Vec<f32> = self.pcm.drain(..OPUS_FRAME_SAMPLES).collect();
            let mut packet = vec![0u8; MAX_OPUS_PACKET];
            // SAFETY: `frame` holds exactly one frame, `packet` is writable for its length
            let len = unsafe {
                libopus_sys::opus_encode_float(
                    self.encoder,
                    frame.as_ptr(),
                    OPUS_FRAME_SAMPLES as i32,
                    packet.as_mut_ptr(),
                    packet.len() as i32,
                )
            };
            if len < 0 {
                log::warn!("opus encode failed: {len}");
                continue;
            }
            packet.truncate(len as usize);
            out.push(MediaSample {
                data: Bytes::from(packet),
                duration: OPUS_FRAME,
            });
        }
        out
    }

    fn clear(&mut self) {
        self.pcm.clear();
    }
}

impl Drop for OpusFrames {
    fn drop(&mut self) {
        // SAFETY: created in `new`, destroyed only here
        unsafe { libopus_sys::opus_encoder_destroy(self.encoder) };
    }
}

fn run_camera(
    index: u32,
    track: MediaTrack,
    ready: Ready,
    running: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
) {
    let (mut camera, mut encoder) = match open_camera(index) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let frame_time = Duration::from_secs(1) / camera.frame_rate().max(1);
    let mut was_enabled = true;
    while running.load(Ordering::SeqCst) {
        let frame = match camera.frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("camera {index} stopped delivering frames: {e}");
                break;
            }
        };
        let on = enabled.load(Ordering::SeqCst);
        if !on {
            // blanked: frames are read and discarded
            was_enabled = false;
            continue;
        }
        if !was_enabled {
            // the far side needs a keyframe to resume
            encoder.force_intra_frame();
            was_enabled = true;
        }

        let image = match frame.decode_image::<RgbFormat>() {
            Ok(image) => image,
            Err(e) => {
                log::debug!("undecodable camera frame: {e}");
                continue;
            }
        };
        let width = image.width() as usize & !1;
        let height = image.height() as usize & !1;
        let yuv = YUVBuffer::from_vec(
            rgb_to_i420(image.as_raw(), image.width() as usize, width, height),
            width,
            height,
        );
        match encoder.encode(&yuv) {
            Ok(bits) => {
                track.push_sample(MediaSample {
                    data: Bytes::from(bits.to_vec()),
                    duration: frame_time,
                });
            }
            Err(e) => log::warn!("h264 encode failed: {e}"),
        }
    }
    if let Err(e) = camera.stop_stream() {
        log::debug!("stopping camera {index}: {e}");
    }
}

fn open_camera(index: u32) -> Result<(Camera, Encoder), DeviceError> {
    let device = format!("camera {index}");
    let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let mut camera = Camera::new(CameraIndex::Index(index), format)
        .map_err(|e| DeviceError::from_os_message(&device, &e.to_string()))?;
    camera
        .open_stream()
        .map_err(|e| DeviceError::from_os_message(&device, &e.to_string()))?;
    let encoder = Encoder::new()
        .map_err(|e| DeviceError::Unavailable(format!("h264 encoder init failed: {e}")))?;
    Ok((camera, encoder))
}

/// Packed RGB24 rows of `stride` pixels to planar I420 of `width` x `height`
/// (both even), BT.601 studio range.
fn rgb_to_i420(rgb: &[u8], stride: usize, width: usize, height: usize) -> Vec<u8> {
    let luma = width * height;
    let chroma = (width / 2) * (height / 2);
    let mut out = vec![0u8; luma + 2 * chroma];
    let (y_plane, uv) = out.split_at_mut(luma);
    let (u_plane, v_plane) = uv.split_at_mut(chroma);

    for row in 0..height {
        for col in 0..width {
            let at = (row * stride + col) * 3;
            let (r, g, b) = (rgb[at] as i32, rgb[at + 1] as i32, rgb[at + 2] as i32);
            let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[row * width + col] = y.clamp(0, 255) as u8;
            if row % 2 == 0 && col % 2 == 0 {
                let i = (row / 2) * (width / 2) + col / 2;
                let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[i] = u.clamp(0, 255) as u8;
                v_plane[i] = v.clamp(0, 255) as u8;
            }
        }
    }
    out
}
