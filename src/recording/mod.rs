//! Audio recording pipeline.
//!
//! Both directions of a call are captured as raw RTP payloads with their
//! receive times. Each session's capture holds a reference count starting
//! at two — one per direction; when the last stream terminates the capture
//! is finalized: timestamps are rewritten onto a dense 48 kHz clock, each
//! direction becomes a mono Ogg/Opus file, an external merger joins them
//! into one stereo file, and the artifacts are uploaded.
//!
//! A periodic sweep discards captures whose chunks have gone stale,
//! regardless of reference count, to bound memory on abandoned sessions.

pub mod encode;
pub mod merge;
pub mod ogg;
pub mod storage;

pub use storage::AudioStorage;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;

use encode::{plan_timeline, rewrite_chunks, write_mono_ogg, OUTBOUND_DELAY_MS};
use storage::object_name;

/// Captures older than this are discarded by the sweep.
pub const CHUNK_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDirection {
    Inbound,
    Outbound,
}

/// One captured RTP packet.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub seq: u16,
    pub rtp_timestamp: u32,
    pub payload: Bytes,
    /// Wall-clock receive time in epoch milliseconds.
    pub receive_time_ms: u64,
}

struct SessionCapture {
    inbound: Mutex<Vec<AudioChunk>>,
    outbound: Mutex<Vec<AudioChunk>>,
    conversation_id: Mutex<Option<String>>,
    /// One reference per direction.
    refs: AtomicUsize,
    finalized: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl SessionCapture {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            conversation_id: Mutex::new(None),
            refs: AtomicUsize::new(2),
            finalized: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        })
    }
}

pub struct Recorder {
    enabled: bool,
    storage: Arc<AudioStorage>,
    tmp_dir: std::path::PathBuf,
    sessions: Mutex<HashMap<String, Arc<SessionCapture>>>,
}

impl Recorder {
    pub fn new(storage: AudioStorage) -> Self {
        Self {
            enabled: storage.is_enabled(),
            storage: Arc::new(storage),
            tmp_dir: std::env::temp_dir(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// A recorder that captures nothing.
    pub fn disabled() -> Self {
        Self::new(AudioStorage::Disabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Capture one RTP payload.
    pub fn record(
        &self,
        session_id: &str,
        direction: AudioDirection,
        seq: u16,
        rtp_timestamp: u32,
        payload: Bytes,
    ) {
        if !self.enabled {
            return;
        }
        let capture = {
            let mut sessions = self.sessions.lock();
            Arc::clone(
                sessions
                    .entry(session_id.to_owned())
                    .or_insert_with(SessionCapture::new),
            )
        };
        let chunk = AudioChunk {
            seq,
            rtp_timestamp,
            payload,
            receive_time_ms: epoch_ms(),
        };
        *capture.last_activity.lock() = Instant::now();
        match direction {
            AudioDirection::Inbound => capture.inbound.lock().push(chunk),
            AudioDirection::Outbound => capture.outbound.lock().push(chunk),
        }
    }

    /// Attach the conversation id the artifacts will be named after.
    pub fn set_conversation_id(&self, session_id: &str, conversation_id: &str) {
        if !self.enabled {
            return;
        }
        let capture = {
            let mut sessions = self.sessions.lock();
            Arc::clone(
                sessions
                    .entry(session_id.to_owned())
                    .or_insert_with(SessionCapture::new),
            )
        };
        *capture.conversation_id.lock() = Some(conversation_id.to_owned());
    }

    /// One stream of the session terminated. When the last reference drops
    /// the capture is finalized asynchronously.
    pub fn release(&self, session_id: &str) {
        if !self.enabled {
            return;
        }
        let capture = match self.sessions.lock().get(session_id) {
            Some(capture) => Arc::clone(capture),
            None => return,
        };
        let previous = capture.refs.fetch_sub(1, Ordering::AcqRel);
        if previous != 1 {
            return;
        }
        if capture.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sessions.lock().remove(session_id);

        let storage = Arc::clone(&self.storage);
        let tmp_dir = self.tmp_dir.clone();
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            if let Err(e) = finalize_capture(capture, storage, tmp_dir, &session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "recording finalize failed");
            }
        });
    }

    /// Discard stale captures regardless of reference count.
    pub fn sweep(&self) {
        self.sweep_older_than(CHUNK_MAX_AGE);
    }

    fn sweep_older_than(&self, max_age: Duration) {
        if !self.enabled {
            return;
        }
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|session_id, capture| {
            let stale = capture.last_activity.lock().elapsed() >= max_age;
            if stale {
                tracing::warn!(session_id = %session_id, "stale audio capture discarded");
            }
            !stale
        });
        let discarded = before - sessions.len();
        if discarded > 0 {
            tracing::info!(discarded, "audio capture sweep complete");
        }
    }

    pub fn spawn_sweep_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let recorder = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                recorder.sweep();
            }
        })
    }

    #[cfg(test)]
    fn capture_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Encode both directions, merge, upload, and clean temporaries.
async fn finalize_capture(
    capture: Arc<SessionCapture>,
    storage: Arc<AudioStorage>,
    tmp_dir: std::path::PathBuf,
    session_id: &str,
) -> anyhow::Result<()> {
    let conversation_id = capture
        .conversation_id
        .lock()
        .clone()
        .ok_or_else(|| anyhow::anyhow!("capture has no conversation id"))?;
    let inbound = std::mem::take(&mut *capture.inbound.lock());
    let outbound = std::mem::take(&mut *capture.outbound.lock());

    let Some(timeline) = plan_timeline(&inbound, &outbound) else {
        tracing::debug!(session_id = %session_id, "no audio captured; nothing to finalize");
        return Ok(());
    };
    tracing::info!(
        session_id = %session_id,
        conversation_id = %conversation_id,
        inbound_packets = inbound.len(),
        outbound_packets = outbound.len(),
        duration_ms = timeline.duration_ms,
        "finalizing call recording"
    );

    let left_path = tmp_dir.join(format!("conversation_{conversation_id}_left.opus"));
    let right_path = tmp_dir.join(format!("conversation_{conversation_id}_right.opus"));
    let merged_path = tmp_dir.join(format!("conversation_{conversation_id}_merged.opus"));

    // Inbound goes to the left channel as-is; outbound to the right with
    // the fixed alignment delay.
    let left = rewrite_chunks(&inbound, timeline.earliest_ms, 0);
    let right = rewrite_chunks(&outbound, timeline.earliest_ms, OUTBOUND_DELAY_MS);
    write_mono_ogg(&left_path, &left, timeline.duration_ms)?;
    write_mono_ogg(&right_path, &right, timeline.duration_ms)?;

    let result = async {
        merge::merge_stereo(&left_path, &right_path, &merged_path).await?;
        storage
            .store(&left_path, &object_name(&conversation_id, "left"))
            .await?;
        storage
            .store(&right_path, &object_name(&conversation_id, "right"))
            .await?;
        let stored = storage
            .store(&merged_path, &object_name(&conversation_id, "merged"))
            .await?;
        tracing::info!(
            session_id = %session_id,
            stored = %stored,
            "call recording uploaded"
        );
        anyhow::Ok(())
    }
    .await;

    // Best-effort temporary cleanup in every outcome.
    for path in [&left_path, &right_path, &merged_path] {
        let _ = tokio::fs::remove_file(path).await;
    }
    result
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageConfig, StorageKind};

    fn local_recorder(dir: &std::path::Path) -> Recorder {
        Recorder::new(AudioStorage::from_config(&StorageConfig {
            enabled: true,
            kind: StorageKind::Local,
            path: dir.to_string_lossy().into_owned(),
        }))
    }

    #[test]
    fn disabled_recorder_captures_nothing() {
        let recorder = Recorder::disabled();
        recorder.record("s1", AudioDirection::Inbound, 1, 960, Bytes::from_static(b"x"));
        assert_eq!(recorder.capture_count(), 0);
    }

    #[tokio::test]
    async fn refcount_finalizes_on_second_release() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = local_recorder(dir.path());
        recorder.record("s1", AudioDirection::Inbound, 1, 960, Bytes::from_static(b"x"));
        recorder.set_conversation_id("s1", "c1");

        recorder.release("s1");
        // First release keeps the capture alive.
        assert_eq!(recorder.capture_count(), 1);
        recorder.release("s1");
        assert_eq!(recorder.capture_count(), 0);
        // A third release is a no-op.
        recorder.release("s1");
    }

    #[test]
    fn sweep_discards_stale_captures_regardless_of_refs() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = local_recorder(dir.path());
        recorder.record("s1", AudioDirection::Inbound, 1, 960, Bytes::from_static(b"x"));
        // Both references are still held; age alone must reclaim it.
        recorder.sweep_older_than(Duration::ZERO);
        assert_eq!(recorder.capture_count(), 0);
    }

    #[test]
    fn sweep_keeps_active_captures() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = local_recorder(dir.path());
        recorder.record("s1", AudioDirection::Inbound, 1, 960, Bytes::from_static(b"x"));
        recorder.sweep();
        assert_eq!(recorder.capture_count(), 1);
    }
}
