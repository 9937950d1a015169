//! Outbound Opus frame writers.
//!
//! Model audio reaches the caller through an [`OpusWriter`]: either the
//! WebRTC outbound track (WhatsApp, web and test channels) or a LiveKit
//! sample track. Writers assume strict 20 ms framing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// One encoded 20 ms Opus frame per call.
#[async_trait]
pub trait OpusWriter: Send + Sync {
    async fn write_opus_frame(&self, payload: Bytes) -> anyhow::Result<()>;
}

/// Writes frames onto a WebRTC outbound track. Writes after `close` are
/// silently discarded — cleanup races with the last model deltas.
pub struct WebRtcTrackWriter {
    track: Arc<TrackLocalStaticSample>,
    closed: AtomicBool,
}

impl WebRtcTrackWriter {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Arc<Self> {
        Arc::new(Self {
            track,
            closed: AtomicBool::new(false),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpusWriter for WebRtcTrackWriter {
    async fn write_opus_frame(&self, payload: Bytes) -> anyhow::Result<()> {
        if self.is_closed() || payload.is_empty() {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data: payload,
                duration: Duration::from_millis(20),
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("track write failed: {e}"))
    }
}
