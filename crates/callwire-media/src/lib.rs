//! Local video sources for callwire.
//!
//! [`resolve`] turns an optional file path into a [`VideoTrack`]: a WebRTC
//! sample track plus the feeder that pushes encoded frames into it once the
//! call is live.

#![forbid(unsafe_code)]

pub mod device;
pub mod file;

use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use callwire_common::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

pub use device::{DeviceSpec, DEFAULT_FFMPEG};
pub use file::{Container, FrameReader};

/// Frame interval used when the source does not declare one (30 fps).
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_nanos(33_333_333);

const FRAME_QUEUE: usize = 32;
const TRACK_ID: &str = "video";
const STREAM_ID: &str = "callwire";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
}

impl VideoCodec {
    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::Vp8 => MIME_TYPE_VP8,
            VideoCodec::Vp9 => MIME_TYPE_VP9,
            VideoCodec::H264 => MIME_TYPE_H264,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaOptions {
    /// ffmpeg executable used for camera capture.
    pub ffmpeg: String,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            ffmpeg: DEFAULT_FFMPEG.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    File { path: PathBuf, container: Container },
    Device(DeviceSpec),
    /// A track that never receives frames.
    #[cfg(any(test, feature = "test-util"))]
    Silent,
}

/// Open the explicit file if given, otherwise the platform's default camera.
pub fn resolve(explicit: Option<&Path>, options: &MediaOptions) -> Result<VideoTrack> {
    match explicit {
        Some(path) => {
            let container = file::probe(path)?;
            info!("video source: {} ({:?})", path.display(), container);
            Ok(VideoTrack::new(
                container.codec(),
                SourceKind::File {
                    path: path.to_path_buf(),
                    container,
                },
                options,
            ))
        }
        None => {
            let spec = DeviceSpec::platform_default();
            spec.check_present()?;
            device::probe_ffmpeg(&options.ffmpeg)?;
            info!("video source: {} {}", spec.format, spec.input);
            Ok(VideoTrack::new(
                VideoCodec::H264,
                SourceKind::Device(spec),
                options,
            ))
        }
    }
}

struct Feeder {
    child: Option<Child>,
    writer: JoinHandle<()>,
}

impl Feeder {
    fn stop(mut self) {
        self.writer.abort();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("capture process already gone: {}", e);
            }
            reap(child);
        }
    }
}

/// Collect a killed capture process. Inside a runtime the wait moves to the
/// blocking pool.
fn reap(mut child: Child) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || {
                if let Err(e) = child.wait() {
                    debug!("failed to reap capture process: {}", e);
                }
            });
        }
        Err(_) => {
            let _ = child.wait();
        }
    }
}

/// A local video track bound to at most one peer connection at a time.
pub struct VideoTrack {
    track: Arc<TrackLocalStaticSample>,
    codec: VideoCodec,
    source: SourceKind,
    ffmpeg: String,
    attached: AtomicBool,
    feeder: Mutex<Option<Feeder>>,
}

impl VideoTrack {
    fn new(codec: VideoCodec, source: SourceKind, options: &MediaOptions) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: codec.mime_type().to_string(),
                ..Default::default()
            },
            TRACK_ID.to_string(),
            STREAM_ID.to_string(),
        ));
        Self {
            track,
            codec,
            source,
            ffmpeg: options.ffmpeg.clone(),
            attached: AtomicBool::new(false),
            feeder: Mutex::new(None),
        }
    }

    /// A track with no frame source.
    #[cfg(any(test, feature = "test-util"))]
    pub fn silent(codec: VideoCodec) -> Self {
        Self::new(codec, SourceKind::Silent, &MediaOptions::default())
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn source(&self) -> &SourceKind {
        &self.source
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.lock_feeder().is_some()
    }

    fn lock_feeder(&self) -> MutexGuard<'_, Option<Feeder>> {
        self.feeder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the track for one peer connection.
    pub fn attach(&self) -> Result<Arc<dyn TrackLocal + Send + Sync>> {
        if self
            .attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::media_unavailable(
                "video track is already attached to a peer connection",
            ));
        }
        Ok(Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>)
    }

    /// Begin pushing frames into the track. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut feeder = self.lock_feeder();
        if feeder.is_some() {
            return Ok(());
        }

        let (mut reader, child, paced) = match &self.source {
            SourceKind::File { path, container } => {
                (FrameReader::open(path, *container)?, None, true)
            }
            SourceKind::Device(spec) => {
                let (child, stdout) = device::spawn_capture(&self.ffmpeg, spec)?;
                (FrameReader::annex_b(Box::new(stdout)), Some(child), false)
            }
            #[cfg(any(test, feature = "test-util"))]
            SourceKind::Silent => return Ok(()),
        };

        let (tx, mut rx) = mpsc::channel::<(Bytes, Duration)>(FRAME_QUEUE);
        tokio::task::spawn_blocking(move || {
            while let Some(sample) = reader.next_sample() {
                if tx.blocking_send(sample).is_err() {
                    return;
                }
            }
            debug!("video source reached end of stream");
        });

        let track = Arc::clone(&self.track);
        let writer = tokio::spawn(async move {
            let mut written: u64 = 0;
            while let Some((data, duration)) = rx.recv().await {
                let sample = Sample {
                    data,
                    duration,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    warn!("failed to write video sample: {}", e);
                    break;
                }
                written += 1;
                if paced && !duration.is_zero() {
                    tokio::time::sleep(duration).await;
                }
            }
            info!("video feeder stopped after {} samples", written);
        });

        *feeder = Some(Feeder { child, writer });
        Ok(())
    }

    /// Stop the feeder and make the track attachable again.
    pub fn release(&self) {
        if let Some(feeder) = self.lock_feeder().take() {
            feeder.stop();
        }
        self.attached.store(false, Ordering::SeqCst);
    }
}

impl Drop for VideoTrack {
    fn drop(&mut self) {
        if let Some(feeder) = self.lock_feeder().take() {
            feeder.stop();
        }
    }
}
