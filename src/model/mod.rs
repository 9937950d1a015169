//! Per-call connection to the realtime model provider.
//!
//! The adapter is polymorphic over `openai` and `gemini` through a tagged
//! variant: both providers speak a WebSocket protocol with a configuration
//! handshake, base64 PCM ingress and PCM egress, so the connection object is
//! shared and only the wire dialect differs.
//!
//! The greeting gate lives here: with signal control enabled the session
//! configuration is sent immediately but the first response is withheld
//! until the channel confirms the peer is present and calls
//! [`ModelConnection::trigger_greeting`].

pub mod gemini;
pub mod openai;

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::events::{Event, EventBus, EventType};
use crate::recording::{AudioDirection, Recorder};
use crate::store::MessageRole;
use crate::webrtc::OpusWriter;

// ── Provider tag ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    OpenAi,
    Gemini,
}

impl ModelProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }

    pub fn from_str_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// PCM16 sample rate the provider expects on ingress.
    pub fn input_sample_rate(self) -> u32 {
        match self {
            Self::OpenAi => 24_000,
            Self::Gemini => 16_000,
        }
    }

    /// PCM16 sample rate the provider produces on egress.
    pub fn output_sample_rate(self) -> u32 {
        24_000
    }
}

// ── Settings ───────────────────────────────────────────────────────

/// Everything a provider session needs, resolved from the agent config and
/// the deployment config at call start.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub provider: ModelProvider,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub voice: String,
    pub language: String,
    pub accent: String,
    /// Provider system instructions (agent system + realtime template).
    pub instructions: String,
    /// Opening line spoken when the greeting is released.
    pub greeting_instructions: String,
}

impl ModelSettings {
    pub fn resolve(
        provider: ModelProvider,
        config: &Config,
        voice: &str,
        language: &str,
        accent: &str,
        instructions: String,
        greeting_instructions: String,
    ) -> anyhow::Result<Self> {
        let (api_key, base_url, model) = match provider {
            ModelProvider::OpenAi => (
                config
                    .openai
                    .api_key
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is not configured"))?,
                config.openai.base_url.clone(),
                openai::DEFAULT_MODEL.to_owned(),
            ),
            ModelProvider::Gemini => (
                config
                    .gemini
                    .api_key
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("GEMINI_API_KEY is not configured"))?,
                config.gemini.base_url.clone(),
                config.gemini.model.clone(),
            ),
        };
        Ok(Self {
            provider,
            api_key,
            base_url,
            model,
            voice: voice.to_owned(),
            language: language.to_owned(),
            accent: accent.to_owned(),
            instructions,
            greeting_instructions,
        })
    }
}

// ── Provider-agnostic events ───────────────────────────────────────

/// What a provider socket reports upward, independent of dialect.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// Handshake acknowledged; the session is configured.
    Ready,
    /// First audio delta of the session arrived.
    AudioStarted,
    /// PCM16 audio delta at [`ModelProvider::output_sample_rate`].
    Audio(Vec<u8>),
    /// Transcript of the caller's speech.
    UserTranscript(String),
    /// Transcript of the model's speech.
    AssistantTranscript(String),
    /// The model finished a response turn.
    ResponseDone,
    /// The model was interrupted by new caller speech.
    Interrupted,
    Error(String),
}

/// Commands accepted by a provider's outbound socket loop.
#[derive(Debug)]
pub enum ProviderCommand {
    /// Raw PCM16 at the provider's input rate.
    Pcm(Vec<u8>),
    /// Prime the session with prior conversation turns.
    History(Vec<(MessageRole, String)>),
    /// Release the withheld greeting.
    TriggerGreeting,
    Close,
}

// ── Audio egress ───────────────────────────────────────────────────

/// Where decoded model audio goes for one session.
pub enum OutputTarget {
    /// WebRTC-style sink: strict 20 ms Opus frames.
    Opus(Arc<dyn OpusWriter>),
    /// LiveKit-style sink: raw PCM16 samples at the provider output rate.
    Pcm(mpsc::Sender<Vec<i16>>),
}

/// Shared egress point. The channel adapter attaches the concrete target
/// once media is ready; until then model audio is dropped.
pub struct AudioOutput {
    session_id: String,
    target: RwLock<Option<OutputTarget>>,
    recorder: Option<Arc<Recorder>>,
    closed: AtomicBool,
    rtp_seq: AtomicU16,
    rtp_ts: AtomicU32,
}

impl AudioOutput {
    pub fn new(session_id: &str, recorder: Option<Arc<Recorder>>) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.to_owned(),
            target: RwLock::new(None),
            recorder,
            closed: AtomicBool::new(false),
            rtp_seq: AtomicU16::new(0),
            rtp_ts: AtomicU32::new(0),
        })
    }

    pub fn set_target(&self, target: OutputTarget) {
        *self.target.write() = Some(target);
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(recorder) = &self.recorder {
                recorder.release(&self.session_id);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one encoded 20 ms Opus frame to an Opus target, capturing it
    /// for the recording pipeline. No-op after close or before attach.
    pub async fn write_opus_frame(&self, payload: Bytes) -> anyhow::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let writer = match &*self.target.read() {
            Some(OutputTarget::Opus(writer)) => Some(Arc::clone(writer)),
            _ => None,
        };
        let Some(writer) = writer else { return Ok(()) };

        let seq = self.rtp_seq.fetch_add(1, Ordering::Relaxed);
        // 20 ms at the 48 kHz RTP clock.
        let ts = self.rtp_ts.fetch_add(960, Ordering::Relaxed);
        if let Some(recorder) = &self.recorder {
            recorder.record(&self.session_id, AudioDirection::Outbound, seq, ts, payload.clone());
        }
        writer.write_opus_frame(payload).await
    }

    /// Forward raw PCM16 samples to a PCM target. No-op otherwise.
    pub async fn write_pcm(&self, samples: Vec<i16>) {
        if self.is_closed() {
            return;
        }
        let sender = match &*self.target.read() {
            Some(OutputTarget::Pcm(tx)) => Some(tx.clone()),
            _ => None,
        };
        if let Some(tx) = sender {
            // Dropped frames are preferable to backpressure into the socket.
            let _ = tx.try_send(samples);
        }
    }

    pub fn wants_opus(&self) -> bool {
        matches!(&*self.target.read(), Some(OutputTarget::Opus(_)))
    }
}

// ── PCM framing ────────────────────────────────────────────────────

/// Accumulates PCM16 bytes and emits fixed-size sample frames.
pub struct Pcm16Framer {
    frame_samples: usize,
    pending: Vec<i16>,
}

impl Pcm16Framer {
    /// A framer emitting `frame_ms` frames at `sample_rate`.
    pub fn new(sample_rate: u32, frame_ms: u32) -> Self {
        Self {
            frame_samples: (sample_rate as usize * frame_ms as usize) / 1000,
            pending: Vec::new(),
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Push little-endian PCM16 bytes; returns every complete frame.
    pub fn push(&mut self, pcm: &[u8]) -> Vec<Vec<i16>> {
        // An odd trailing byte cannot happen with well-formed PCM16; drop it.
        for pair in pcm.chunks_exact(2) {
            self.pending.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    /// Remaining samples padded with silence to a full frame, if any.
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.pending);
        frame.resize(self.frame_samples, 0);
        Some(frame)
    }
}

// ── Connection handle ──────────────────────────────────────────────

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Handle to one live provider session.
pub struct ModelConnection {
    session_id: String,
    provider: ModelProvider,
    command_tx: mpsc::Sender<ProviderCommand>,
    /// When set, the greeting waits for an explicit trigger.
    signal_control: AtomicBool,
    greeting_dispatched: AtomicBool,
    connected: AtomicBool,
    language_accent: RwLock<(String, String)>,
    on_close: Mutex<Option<CloseCallback>>,
    close_fired: AtomicBool,
}

impl ModelConnection {
    /// Open a provider session. Performs the synchronous handshake (socket
    /// connect + session configuration) and publishes `AIConnectionInit` on
    /// success. Model audio flows into `output`.
    pub async fn connect(
        settings: ModelSettings,
        session_id: &str,
        event_bus: Arc<EventBus>,
        output: Arc<AudioOutput>,
        events_tx: mpsc::Sender<ModelEvent>,
    ) -> anyhow::Result<Arc<Self>> {
        let (command_tx, command_rx) = mpsc::channel::<ProviderCommand>(256);

        let connection = Arc::new(Self {
            session_id: session_id.to_owned(),
            provider: settings.provider,
            command_tx,
            signal_control: AtomicBool::new(false),
            greeting_dispatched: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            language_accent: RwLock::new((settings.language.clone(), settings.accent.clone())),
            on_close: Mutex::new(None),
            close_fired: AtomicBool::new(false),
        });

        match settings.provider {
            ModelProvider::OpenAi => {
                openai::spawn_session(
                    settings,
                    Arc::clone(&connection),
                    command_rx,
                    output,
                    events_tx,
                )
                .await?
            }
            ModelProvider::Gemini => {
                gemini::spawn_session(
                    settings,
                    Arc::clone(&connection),
                    command_rx,
                    output,
                    events_tx,
                )
                .await?
            }
        }

        connection.connected.store(true, Ordering::SeqCst);
        event_bus.publish(Event::new(EventType::AiConnectionInit, session_id));
        tracing::info!(
            session_id = %session_id,
            provider = connection.provider.as_str(),
            "model connection initialized"
        );
        Ok(connection)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn provider(&self) -> ModelProvider {
        self.provider
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Push caller PCM16 (at the provider input rate). Frames are dropped
    /// rather than applying backpressure to the RTP reader.
    pub fn send_pcm(&self, pcm: Vec<u8>) {
        if let Err(e) = self.command_tx.try_send(ProviderCommand::Pcm(pcm)) {
            if matches!(e, mpsc::error::TrySendError::Full(_)) {
                tracing::trace!(session_id = %self.session_id, "provider ingress full; frame dropped");
            }
        }
    }

    pub async fn add_conversation_history(
        &self,
        turns: Vec<(MessageRole, String)>,
    ) -> anyhow::Result<()> {
        self.command_tx
            .send(ProviderCommand::History(turns))
            .await
            .map_err(|_| anyhow::anyhow!("provider session closed"))
    }

    /// Withhold the greeting until `trigger_greeting`.
    pub fn enable_greeting_signal_control(&self) {
        self.signal_control.store(true, Ordering::SeqCst);
    }

    pub fn greeting_signal_controlled(&self) -> bool {
        self.signal_control.load(Ordering::SeqCst)
    }

    /// Release the greeting. Only the first call dispatches; subsequent
    /// calls (and concurrent ones) are no-ops.
    pub async fn trigger_greeting(&self) -> anyhow::Result<bool> {
        if self
            .greeting_dispatched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        self.command_tx
            .send(ProviderCommand::TriggerGreeting)
            .await
            .map_err(|_| anyhow::anyhow!("provider session closed"))?;
        Ok(true)
    }

    pub fn get_current_language_accent(&self) -> (String, String) {
        self.language_accent.read().clone()
    }

    pub fn set_on_connection_close(&self, callback: CloseCallback) {
        *self.on_close.lock() = Some(callback);
    }

    /// Invoked by the socket loops when the provider goes away, and by
    /// `close`. Fires the close callback exactly once.
    pub(crate) fn fire_close(&self) {
        if self.close_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(callback) = self.on_close.lock().take() {
            callback();
        }
    }

    pub async fn close(&self) {
        let _ = self.command_tx.send(ProviderCommand::Close).await;
        self.fire_close();
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_tags_roundtrip() {
        assert_eq!(ModelProvider::from_str_tag("openai"), Some(ModelProvider::OpenAi));
        assert_eq!(ModelProvider::from_str_tag("GEMINI"), Some(ModelProvider::Gemini));
        assert_eq!(ModelProvider::from_str_tag("claude"), None);
        assert_eq!(ModelProvider::OpenAi.as_str(), "openai");
    }

    #[test]
    fn provider_sample_rates() {
        assert_eq!(ModelProvider::OpenAi.input_sample_rate(), 24_000);
        assert_eq!(ModelProvider::Gemini.input_sample_rate(), 16_000);
        assert_eq!(ModelProvider::Gemini.output_sample_rate(), 24_000);
    }

    #[test]
    fn framer_emits_full_frames_only() {
        let mut framer = Pcm16Framer::new(24_000, 20);
        assert_eq!(framer.frame_samples(), 480);

        // 479 samples: nothing yet.
        let frames = framer.push(&vec![0u8; 479 * 2]);
        assert!(frames.is_empty());

        // One more sample completes the frame.
        let frames = framer.push(&[1, 0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 480);
        assert_eq!(frames[0][479], 1);
    }

    #[test]
    fn framer_splits_large_pushes() {
        let mut framer = Pcm16Framer::new(24_000, 20);
        let frames = framer.push(&vec![0u8; 480 * 2 * 3 + 10]);
        assert_eq!(frames.len(), 3);
        let tail = framer.flush().unwrap();
        assert_eq!(tail.len(), 480);
    }

    #[test]
    fn framer_flush_empty_is_none() {
        let mut framer = Pcm16Framer::new(16_000, 20);
        assert!(framer.flush().is_none());
    }

    #[tokio::test]
    async fn output_drops_audio_before_target_attached() {
        let output = AudioOutput::new("s1", None);
        // Neither call may fail without a target.
        output.write_opus_frame(Bytes::from_static(b"frame")).await.unwrap();
        output.write_pcm(vec![0i16; 480]).await;
        assert!(!output.wants_opus());
    }

    #[tokio::test]
    async fn output_pcm_target_receives_samples() {
        let output = AudioOutput::new("s1", None);
        let (tx, mut rx) = mpsc::channel(4);
        output.set_target(OutputTarget::Pcm(tx));

        output.write_pcm(vec![7i16; 10]).await;
        assert_eq!(rx.recv().await.unwrap(), vec![7i16; 10]);

        output.close();
        output.write_pcm(vec![1i16; 10]).await;
        assert!(rx.try_recv().is_err());
    }
}
