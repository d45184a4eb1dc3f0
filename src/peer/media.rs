use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::Result;

static FORK_COUNTER: AtomicU64 = AtomicU64::new(1);
const FRAME_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// One encoded frame from the capture device: VP8 for video, Opus for audio.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// Owned handle to one audio or video track.
///
/// `stop` is idempotent: the release hook (device release for local capture)
/// runs on the first call only.
///
/// The capture adapter feeds encoded frames in with `push_frame`; forks share
/// the feed, and each transport subscribes with `frames`.
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    frames: broadcast::Sender<EncodedFrame>,
    release: Mutex<Option<ReleaseHook>>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Self::build(id.into(), kind, frames, None)
    }

    pub fn with_release(
        id: impl Into<String>,
        kind: TrackKind,
        release: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Self::build(id.into(), kind, frames, Some(Box::new(release)))
    }

    fn build(
        id: String,
        kind: TrackKind,
        frames: broadcast::Sender<EncodedFrame>,
        release: Option<ReleaseHook>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            kind,
            stopped: AtomicBool::new(false),
            stop_tx,
            frames,
            release: Mutex::new(release),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Publishes a captured frame to every subscribed transport. Returns how
    /// many received it; frames on a stopped track are dropped.
    pub fn push_frame(&self, frame: EncodedFrame) -> usize {
        if self.is_stopped() {
            return 0;
        }
        self.frames.send(frame).unwrap_or(0)
    }

    pub fn frames(&self) -> broadcast::Receiver<EncodedFrame> {
        self.frames.subscribe()
    }

    /// Transports currently consuming this track's feed.
    pub fn frame_subscribers(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Resolves `changed()` once the track is stopped.
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Returns `true` when this call is the one that stopped the track.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }

        let hook = self
            .release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(hook) = hook {
            hook();
        }
        self.stop_tx.send_replace(true);
        tracing::debug!(track_id = %self.id, kind = ?self.kind, "Track stopped");
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { id: id.into(), tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Stops every track, returning how many were still live.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|track| track.stop()).count()
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }

    /// Independent handles onto the same capture, like `MediaStreamTrack.clone()`.
    /// Stopping a fork never releases the device; only the original does.
    pub fn fork(&self) -> MediaStream {
        let n = FORK_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tracks = self
            .tracks
            .iter()
            .map(|track| {
                MediaTrack::build(
                    format!("{}#{}", track.id(), n),
                    track.kind(),
                    track.frames.clone(),
                    None,
                )
            })
            .collect();
        MediaStream::new(format!("{}#{}", self.id, n), tracks)
    }
}

/// Access to the local camera and microphone.
///
/// Fails with `MediaPermissionDenied` or `MediaDeviceUnavailable`.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<MediaStream>;
}
