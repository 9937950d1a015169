//! Per-call session state.
//!
//! A [`CallSession`] is created by a channel adapter, owned by this pod's
//! [`SessionManager`], and mutated only under its own lock (plus a handful
//! of lock-free flags). The `atomic_closed` word transitions 0→1 exactly
//! once; after that no writer publishes audio and no conversation rows are
//! created.

pub mod greeting;
pub mod manager;

pub use greeting::GreetingGate;
pub use manager::SessionManager;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::model::{AudioOutput, ModelConnection, ModelProvider};
use crate::store::{ActionRecord, ConversationMessage};
use crate::webrtc::WebRtcTrackWriter;

// ── Channel and direction ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Whatsapp,
    Livekit,
    Web,
    Test,
    Outbound,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Livekit => "livekit",
            Self::Web => "web",
            Self::Test => "test",
            Self::Outbound => "outbound",
        }
    }

    /// Channels whose sessions never emit usage or metrics.
    pub fn skips_usage(self) -> bool {
        matches!(self, Self::Test | Self::Livekit)
    }

    /// Channels recorded by the in-process pipeline. LiveKit rooms record
    /// through egress instead; test calls are never recorded.
    pub fn records_audio(self) -> bool {
        matches!(self, Self::Whatsapp | Self::Web | Self::Outbound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

// ── Outbound call state machine ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundCallState {
    Calling,
    WaitingPermission,
    Ringing,
    Accepted,
    Rejected,
    Ended,
}

impl OutboundCallState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calling => "calling",
            Self::WaitingPermission => "waiting_permission",
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Ended => "ended",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Ended)
    }

    /// Legal transitions of the outbound machine. `Ended` is reachable from
    /// every live state (hangup and timeout paths).
    pub fn can_transition_to(self, next: OutboundCallState) -> bool {
        use OutboundCallState::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (_, Ended) => !self.is_terminal(),
            (WaitingPermission, Calling) => true,
            (Calling, Ringing) => true,
            (Ringing, Accepted) | (Ringing, Rejected) => true,
            (Calling, Accepted) | (Calling, Rejected) => true,
            _ => false,
        }
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Construction parameters supplied by the channel adapter.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub id: String,
    pub call_id: String,
    pub channel_type: ChannelType,
    pub direction: CallDirection,
    pub from: String,
    pub to: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub text_agent_id: Option<String>,
    pub voice_language: String,
    pub accent: String,
    pub model_provider: ModelProvider,
}

/// State mutated under the session lock.
#[derive(Default)]
pub struct SessionState {
    pub voice_language: String,
    pub accent: String,
    /// Set at most once; equals the conversation row id afterwards.
    pub conversation_id: Option<String>,
    pub history: Vec<ConversationMessage>,
    pub actions: Vec<ActionRecord>,
    pub last_activity: Option<Instant>,
    pub outbound_state: Option<OutboundCallState>,
    /// Writer toward the caller; set once media is ready.
    pub track_writer: Option<Arc<WebRtcTrackWriter>>,
}

pub struct CallSession {
    pub id: String,
    pub call_id: String,
    pub channel_type: ChannelType,
    pub direction: CallDirection,
    pub from: String,
    pub to: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub text_agent_id: Option<String>,
    pub model_provider: ModelProvider,
    pub created_at: Instant,
    pub created_at_utc: DateTime<Utc>,

    is_active: AtomicBool,
    atomic_closed: AtomicU8,
    greeting_sent: AtomicBool,
    has_inbound_audio: AtomicBool,
    was_connected: AtomicBool,

    pub greeting: GreetingGate,
    pub state: tokio::sync::Mutex<SessionState>,
    model: RwLock<Option<Arc<ModelConnection>>>,
    pub output: Arc<AudioOutput>,
    languages_heard: parking_lot::Mutex<BTreeSet<String>>,
    /// Logged reason of the last gate decision, to log only transitions.
    last_gate_reason: parking_lot::Mutex<&'static str>,
}

impl CallSession {
    pub fn new(params: SessionParams, output: Arc<AudioOutput>) -> Arc<Self> {
        let created_at = Instant::now();
        let mut languages = BTreeSet::new();
        if !params.voice_language.is_empty() {
            languages.insert(params.voice_language.clone());
        }
        let outbound_state =
            (params.direction == CallDirection::Outbound).then_some(OutboundCallState::Calling);
        Arc::new(Self {
            greeting: GreetingGate::new(created_at),
            state: tokio::sync::Mutex::new(SessionState {
                voice_language: params.voice_language.clone(),
                accent: params.accent.clone(),
                outbound_state,
                ..Default::default()
            }),
            id: params.id,
            call_id: params.call_id,
            channel_type: params.channel_type,
            direction: params.direction,
            from: params.from,
            to: params.to,
            tenant_id: params.tenant_id,
            agent_id: params.agent_id,
            text_agent_id: params.text_agent_id,
            model_provider: params.model_provider,
            created_at,
            created_at_utc: Utc::now(),
            is_active: AtomicBool::new(true),
            atomic_closed: AtomicU8::new(0),
            greeting_sent: AtomicBool::new(false),
            has_inbound_audio: AtomicBool::new(false),
            was_connected: AtomicBool::new(false),
            model: RwLock::new(None),
            output,
            languages_heard: parking_lot::Mutex::new(languages),
            last_gate_reason: parking_lot::Mutex::new(""),
        })
    }

    // ── Flags ──────────────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.atomic_closed.load(Ordering::SeqCst) != 0
    }

    /// Try to take ownership of the close transition. Only the first caller
    /// ever sees `true`.
    pub fn begin_close(&self) -> bool {
        let won = self
            .atomic_closed
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.is_active.store(false, Ordering::SeqCst);
        }
        won
    }

    pub fn mark_connected(&self) {
        self.was_connected.store(true, Ordering::SeqCst);
    }

    pub fn was_connected(&self) -> bool {
        self.was_connected.load(Ordering::SeqCst)
    }

    pub fn mark_inbound_audio(&self) {
        self.has_inbound_audio.store(true, Ordering::SeqCst);
    }

    pub fn has_inbound_audio(&self) -> bool {
        self.has_inbound_audio.load(Ordering::SeqCst)
    }

    // ── Greeting ───────────────────────────────────────────────────

    /// Compare-and-set on the greeting flag. Returns whether this caller
    /// performed the transition — exactly one greeting trigger per session
    /// even under concurrent "participant joined" and "call accepted".
    pub fn try_mark_greeting_sent(&self) -> bool {
        let won = self
            .greeting_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.greeting.mark_instruction_sent();
        }
        won
    }

    pub fn greeting_sent(&self) -> bool {
        self.greeting_sent.load(Ordering::SeqCst)
    }

    /// Gate decision for the current instant, logging reason transitions.
    pub fn should_forward_audio(&self) -> (bool, &'static str) {
        let decision = self.greeting.should_forward(Instant::now());
        let mut last = self.last_gate_reason.lock();
        if *last != decision.1 {
            tracing::info!(
                session_id = %self.id,
                forward = decision.0,
                reason = decision.1,
                "audio gate decision changed"
            );
            *last = decision.1;
        }
        decision
    }

    // ── Model connection ───────────────────────────────────────────

    pub fn set_model(&self, model: Arc<ModelConnection>) {
        *self.model.write() = Some(model);
    }

    pub fn model(&self) -> Option<Arc<ModelConnection>> {
        self.model.read().clone()
    }

    pub fn take_model(&self) -> Option<Arc<ModelConnection>> {
        self.model.write().take()
    }

    /// Whether the provider session is up — the outbound readiness poll.
    pub fn is_model_ready(&self) -> bool {
        self.model().map(|m| m.is_connected()).unwrap_or(false)
    }

    // ── Misc ───────────────────────────────────────────────────────

    pub fn note_language(&self, language: &str) {
        if !language.is_empty() {
            self.languages_heard.lock().insert(language.to_owned());
        }
    }

    /// Comma-joined languages heard on this call.
    pub fn languages(&self) -> String {
        let languages = self.languages_heard.lock();
        languages.iter().cloned().collect::<Vec<_>>().join(",")
    }

    /// Transition the outbound machine, rejecting illegal moves.
    pub async fn set_outbound_state(&self, next: OutboundCallState) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let current = state
            .outbound_state
            .ok_or_else(|| anyhow::anyhow!("session {} is not an outbound call", self.id))?;
        if !current.can_transition_to(next) {
            anyhow::bail!(
                "illegal outbound transition {} → {} on {}",
                current.as_str(),
                next.as_str(),
                self.id
            );
        }
        tracing::info!(
            session_id = %self.id,
            from = current.as_str(),
            to = next.as_str(),
            "outbound call state changed"
        );
        state.outbound_state = Some(next);
        Ok(())
    }

    pub async fn outbound_state(&self) -> Option<OutboundCallState> {
        self.state.lock().await.outbound_state
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_params(id: &str) -> SessionParams {
        SessionParams {
            id: id.to_owned(),
            call_id: "C1".to_owned(),
            channel_type: ChannelType::Whatsapp,
            direction: CallDirection::Inbound,
            from: "15551230000".to_owned(),
            to: "15559870000".to_owned(),
            tenant_id: "T1".to_owned(),
            agent_id: "A1".to_owned(),
            text_agent_id: None,
            voice_language: "en".to_owned(),
            accent: "neutral".to_owned(),
            model_provider: ModelProvider::OpenAi,
        }
    }

    fn session(id: &str) -> Arc<CallSession> {
        let output = AudioOutput::new(id, None);
        CallSession::new(test_params(id), output)
    }

    #[test]
    fn close_transition_happens_once() {
        let s = session("s1");
        assert!(s.is_active());
        assert!(!s.is_closed());

        assert!(s.begin_close());
        assert!(s.is_closed());
        assert!(!s.is_active());
        // Everyone after the winner is a no-op.
        assert!(!s.begin_close());
        assert!(!s.begin_close());
    }

    #[test]
    fn concurrent_close_has_single_winner() {
        let s = session("s1");
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let s = Arc::clone(&s);
                    scope.spawn(move || usize::from(s.begin_close()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn greeting_cas_single_winner() {
        let s = session("s1");
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let s = Arc::clone(&s);
                    scope.spawn(move || usize::from(s.try_mark_greeting_sent()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
        assert!(s.greeting_sent());
        assert!(s.greeting.instruction_sent());
    }

    #[test]
    fn channel_type_policies() {
        assert!(ChannelType::Test.skips_usage());
        assert!(ChannelType::Livekit.skips_usage());
        assert!(!ChannelType::Whatsapp.skips_usage());

        assert!(ChannelType::Whatsapp.records_audio());
        assert!(ChannelType::Outbound.records_audio());
        assert!(!ChannelType::Livekit.records_audio());
        assert!(!ChannelType::Test.records_audio());
    }

    #[test]
    fn outbound_transitions() {
        use OutboundCallState::*;
        assert!(Calling.can_transition_to(Ringing));
        assert!(Ringing.can_transition_to(Accepted));
        assert!(Ringing.can_transition_to(Rejected));
        assert!(WaitingPermission.can_transition_to(Calling));
        assert!(Accepted.can_transition_to(Ended));
        assert!(!Rejected.can_transition_to(Calling));
        assert!(!Ended.can_transition_to(Accepted));
        // Terminal states cannot even re-end.
        assert!(!Ended.can_transition_to(Ended));
        assert!(!Rejected.can_transition_to(Ended));
    }

    #[tokio::test]
    async fn outbound_state_machine_on_session() {
        let output = AudioOutput::new("s1", None);
        let mut params = test_params("s1");
        params.direction = CallDirection::Outbound;
        params.channel_type = ChannelType::Outbound;
        let s = CallSession::new(params, output);

        assert_eq!(s.outbound_state().await, Some(OutboundCallState::Calling));
        s.set_outbound_state(OutboundCallState::Ringing).await.unwrap();
        s.set_outbound_state(OutboundCallState::Accepted).await.unwrap();
        assert!(s
            .set_outbound_state(OutboundCallState::Ringing)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn inbound_session_has_no_outbound_machine() {
        let s = session("s1");
        assert_eq!(s.outbound_state().await, None);
        assert!(s.set_outbound_state(OutboundCallState::Ringing).await.is_err());
    }

    #[test]
    fn languages_join_sorted_unique() {
        let s = session("s1");
        s.note_language("es");
        s.note_language("en");
        s.note_language("es");
        s.note_language("");
        assert_eq!(s.languages(), "en,es");
    }
}
