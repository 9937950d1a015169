//! Session ownership, model wiring, and idempotent teardown.
//!
//! The manager owns every session created on this pod. Teardown can be
//! requested by the channel (terminate endpoints), the provider (socket
//! close), the peer (ICE failure) or another pod (cleanup broadcast); the
//! `atomic_closed` CAS in the session makes the observable effect
//! exactly-once no matter how many requests race.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::agents::AgentCache;
use crate::config::DEFAULT_TENANT;
use crate::events::{Event, EventBus, EventType};
use crate::model::{ModelConnection, ModelEvent};
use crate::recording::Recorder;
use crate::registry::{CleanupBus, SessionInfo, SessionRegistry};
use crate::store::{ConversationMessage, ConversationStore, MessageRole};
use crate::usage::{ConversationMetricsEvent, MessageTiming, UsagePublisher, VoiceUsageEvent};
use crate::webrtc::WebRtcProcessor;

use super::{CallSession, SessionParams};

/// Row of the ops session listing.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub call_id: String,
    pub channel_type: &'static str,
    pub direction: &'static str,
    pub tenant_id: String,
    pub agent_id: String,
    pub active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    registry: Arc<SessionRegistry>,
    cleanup_bus: Arc<CleanupBus>,
    webrtc: Arc<WebRtcProcessor>,
    store: Arc<dyn ConversationStore>,
    usage: Arc<UsagePublisher>,
    recorder: Arc<Recorder>,
    event_bus: Arc<EventBus>,
    agent_cache: Arc<AgentCache>,
    /// Back-reference handed to spawned tasks and close callbacks.
    weak_self: RwLock<std::sync::Weak<SessionManager>>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        cleanup_bus: Arc<CleanupBus>,
        webrtc: Arc<WebRtcProcessor>,
        store: Arc<dyn ConversationStore>,
        usage: Arc<UsagePublisher>,
        recorder: Arc<Recorder>,
        event_bus: Arc<EventBus>,
        agent_cache: Arc<AgentCache>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            cleanup_bus,
            webrtc,
            store,
            usage,
            recorder,
            event_bus,
            agent_cache,
            weak_self: RwLock::new(std::sync::Weak::new()),
        });
        *manager.weak_self.write() = Arc::downgrade(&manager);
        manager
    }

    fn strong(&self) -> Option<Arc<SessionManager>> {
        self.weak_self.read().upgrade()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn webrtc(&self) -> &Arc<WebRtcProcessor> {
        &self.webrtc
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Create a session, register it cross-pod, and announce it.
    pub async fn create_session(&self, params: SessionParams) -> anyhow::Result<Arc<CallSession>> {
        let recorder = params
            .channel_type
            .records_audio()
            .then(|| Arc::clone(&self.recorder));
        let output = crate::model::AudioOutput::new(&params.id, recorder);
        let session = CallSession::new(params, output);

        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));

        let info = SessionInfo {
            session_id: session.id.clone(),
            pod_id: self.registry.pod_id().to_owned(),
            agent_id: session.agent_id.clone(),
            start_time: session.created_at_utc,
            channel_type: session.channel_type.as_str().to_owned(),
        };
        if let Err(e) = self.registry.register(&info).await {
            tracing::warn!(session_id = %session.id, error = %e, "session registration failed");
        }

        self.event_bus
            .publish(Event::new(EventType::ConnectionCreated, &session.id));
        tracing::info!(
            session_id = %session.id,
            call_id = %session.call_id,
            channel = session.channel_type.as_str(),
            "session created"
        );
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Find the session handling an external call id.
    pub fn find_by_call_id(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.call_id == call_id)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().values().filter(|s| s.is_active()).count()
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                call_id: s.call_id.clone(),
                channel_type: s.channel_type.as_str(),
                direction: match s.direction {
                    super::CallDirection::Inbound => "inbound",
                    super::CallDirection::Outbound => "outbound",
                },
                tenant_id: s.tenant_id.clone(),
                agent_id: s.agent_id.clone(),
                active: s.is_active(),
                created_at: s.created_at_utc,
            })
            .collect()
    }

    // ── Conversation ───────────────────────────────────────────────

    /// Ensure the conversation row exists and pin its id on the session.
    pub async fn initialize_conversation(&self, session: &Arc<CallSession>) -> anyhow::Result<String> {
        {
            let state = session.state.lock().await;
            if let Some(existing) = &state.conversation_id {
                return Ok(existing.clone());
            }
        }
        let conversation_id = self
            .store
            .ensure_conversation(
                &session.tenant_id,
                &session.agent_id,
                session.channel_type.as_str(),
                &session.call_id,
            )
            .await?;
        {
            let mut state = session.state.lock().await;
            // Set at most once; a racing initializer keeps the first id.
            if let Some(existing) = &state.conversation_id {
                return Ok(existing.clone());
            }
            state.conversation_id = Some(conversation_id.clone());
        }
        self.recorder.set_conversation_id(&session.id, &conversation_id);
        tracing::debug!(
            session_id = %session.id,
            conversation_id = %conversation_id,
            "conversation initialized"
        );
        Ok(conversation_id)
    }

    /// Append a turn to the in-memory history and persist it
    /// asynchronously, creating the conversation row lazily on first write.
    pub async fn add_message(
        &self,
        session: &Arc<CallSession>,
        role: MessageRole,
        content: &str,
        confidence: Option<u8>,
    ) -> Option<ConversationMessage> {
        if session.is_closed() {
            tracing::debug!(session_id = %session.id, "message dropped after close");
            return None;
        }
        let mut message = ConversationMessage::new(role, content);
        if let Some(confidence) = confidence {
            message = message.with_confidence(confidence);
        }
        {
            let mut state = session.state.lock().await;
            state.history.push(message.clone());
            state.last_activity = Some(std::time::Instant::now());
        }

        let Some(manager) = self.strong() else {
            return Some(message);
        };
        let session = Arc::clone(session);
        let persisted = message.clone();
        tokio::spawn(async move {
            let conversation_id = match manager.initialize_conversation(&session).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "conversation ensure failed");
                    return;
                }
            };
            if let Err(e) = manager.store.append_message(&conversation_id, &persisted).await {
                tracing::warn!(session_id = %session.id, error = %e, "message persist failed");
            }
        });
        Some(message)
    }

    // ── Model wiring ───────────────────────────────────────────────

    /// Attach a freshly connected model session: pump its events into the
    /// conversation and the greeting gate, and route its death into cleanup.
    pub fn attach_model(
        &self,
        session: &Arc<CallSession>,
        model: Arc<ModelConnection>,
        mut events_rx: mpsc::Receiver<ModelEvent>,
    ) {
        session.set_model(Arc::clone(&model));
        session.mark_connected();

        let Some(manager) = self.strong() else {
            return;
        };

        // Provider death tears the session down.
        {
            let manager = Arc::clone(&manager);
            let session_id = session.id.clone();
            model.set_on_connection_close(Box::new(move || {
                tokio::spawn(async move {
                    manager.notify_cleanup(&session_id, "model connection closed").await;
                });
            }));
        }

        let session = Arc::clone(session);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ModelEvent::Ready => {
                        tracing::debug!(session_id = %session.id, "model session configured");
                    }
                    ModelEvent::AudioStarted => {
                        session.greeting.mark_audio_started();
                        manager
                            .event_bus
                            .publish(Event::new(EventType::AiAudioReady, &session.id));
                    }
                    ModelEvent::Audio(_) => {}
                    ModelEvent::UserTranscript(text) => {
                        manager
                            .add_message(&session, MessageRole::User, &text, None)
                            .await;
                    }
                    ModelEvent::AssistantTranscript(text) => {
                        manager
                            .add_message(&session, MessageRole::Assistant, &text, None)
                            .await;
                    }
                    ModelEvent::ResponseDone => {
                        // The greeting turn is over; the session is in
                        // realtime mode from here on.
                        if session.greeting_sent() {
                            session.greeting.mark_switched_to_realtime();
                        }
                    }
                    ModelEvent::Interrupted => {
                        tracing::debug!(session_id = %session.id, "model interrupted by caller");
                    }
                    ModelEvent::Error(message) => {
                        tracing::warn!(session_id = %session.id, error = %message, "model error");
                    }
                }
            }
        });
    }

    // ── Teardown ───────────────────────────────────────────────────

    /// Local cleanup. Returns whether this invocation performed the close
    /// (idempotent; safe to call from any path, any number of times).
    pub async fn cleanup_session(&self, session_id: &str, reason: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        if !session.begin_close() {
            return false;
        }
        tracing::info!(session_id = %session_id, reason, "session cleanup started");

        // Stop caller-bound audio first.
        {
            let mut state = session.state.lock().await;
            if let Some(writer) = state.track_writer.take() {
                writer.close();
            }
        }
        session.output.close();

        if let Some(model) = session.take_model() {
            model.close().await;
        }
        self.webrtc.cleanup(session_id).await;

        let conversation_id = {
            let state = session.state.lock().await;
            state.conversation_id.clone()
        };
        if let Some(conversation_id) = &conversation_id {
            if let Err(e) = self.store.mark_ended(conversation_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "conversation end write failed");
            }
        }

        self.emit_usage(&session, conversation_id).await;

        if let Err(e) = self.registry.unregister(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "session unregister failed");
        }
        self.sessions.write().remove(session_id);
        self.event_bus
            .publish(Event::new(EventType::ConnectionTerminated, session_id));
        tracing::info!(session_id = %session_id, "session cleanup complete");
        true
    }

    /// Clean up locally first, then broadcast so any pod holding a stale
    /// reference terminates its copy too.
    pub async fn notify_cleanup(&self, session_id: &str, reason: &str) {
        self.cleanup_session(session_id, reason).await;
        if let Err(e) = self.cleanup_bus.publish(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "cleanup broadcast failed");
        }
    }

    /// Broadcast receiver path: identical local cleanup, no re-broadcast.
    pub async fn handle_cleanup_broadcast(&self, session_id: &str) {
        if self.get(session_id).is_some() {
            self.cleanup_session(session_id, "cleanup broadcast").await;
        }
    }

    /// Drain every active session (graceful shutdown).
    pub async fn terminate_all(&self, reason: &str) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for session_id in ids {
            self.notify_cleanup(&session_id, reason).await;
        }
    }

    /// Usage and metrics emission rules: only ever-connected sessions of a
    /// real tenant on a billable channel. The agent's owning tenant wins
    /// over the channel's when both are known.
    async fn emit_usage(&self, session: &Arc<CallSession>, conversation_id: Option<String>) {
        if !session.was_connected() {
            return;
        }
        if session.channel_type.skips_usage() {
            return;
        }
        let agent_tenant = self
            .agent_cache
            .get(&session.agent_id)
            .map(|agent| agent.tenant_id);
        if let Some(agent_tenant) = &agent_tenant {
            if *agent_tenant != session.tenant_id && session.tenant_id != DEFAULT_TENANT {
                tracing::warn!(
                    session_id = %session.id,
                    agent_tenant = %agent_tenant,
                    channel_tenant = %session.tenant_id,
                    "tenant mismatch; billing the agent's tenant"
                );
            }
        }
        let tenant_id = agent_tenant.unwrap_or_else(|| session.tenant_id.clone());
        if tenant_id == DEFAULT_TENANT {
            return;
        }

        let duration = session.created_at.elapsed().as_secs();
        let usage_event = VoiceUsageEvent {
            tenant_id: tenant_id.clone(),
            agent_id: session.agent_id.clone(),
            duration_seconds: duration,
        };

        let (history, actions) = {
            let state = session.state.lock().await;
            (state.history.clone(), state.actions.clone())
        };
        let metrics_event = conversation_id.map(|conversation_id| ConversationMetricsEvent {
            conversation_id,
            tenant_id,
            agent_id: session
                .text_agent_id
                .clone()
                .unwrap_or_else(|| session.agent_id.clone()),
            channel: "voice".to_owned(),
            language: session.languages(),
            start_at: session.created_at_utc,
            end_at: chrono::Utc::now(),
            duration,
            turn_count: history
                .iter()
                .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
                .count() as u32,
            messages: history
                .iter()
                .map(|m| MessageTiming {
                    id: m.id.to_string(),
                    start_at: m.timestamp,
                    end_at: m.timestamp,
                })
                .collect(),
            actions: actions.iter().map(|a| a.name.clone()).collect(),
            created_at: chrono::Utc::now(),
        });

        let usage = Arc::clone(&self.usage);
        tokio::spawn(async move {
            usage.publish_voice_usage(&usage_event).await;
            if let Some(metrics_event) = metrics_event {
                usage.publish_conversation_metrics(&metrics_event).await;
            }
        });
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CallDirection, ChannelType, SessionParams};
    use crate::store::InMemoryConversationStore;

    // Redis-backed collaborators are exercised in integration environments;
    // these tests run the manager against in-process fakes where possible.

    fn params(id: &str, channel: ChannelType) -> SessionParams {
        SessionParams {
            id: id.to_owned(),
            call_id: format!("call-{id}"),
            channel_type: channel,
            direction: CallDirection::Inbound,
            from: "15551230000".into(),
            to: "15559870000".into(),
            tenant_id: "T1".into(),
            agent_id: "A1".into(),
            text_agent_id: None,
            voice_language: "en".into(),
            accent: "neutral".into(),
            model_provider: crate::model::ModelProvider::OpenAi,
        }
    }

    #[test]
    fn session_summary_serializes_camel_case() {
        let summary = SessionSummary {
            id: "s1".into(),
            call_id: "C1".into(),
            channel_type: "whatsapp",
            direction: "inbound",
            tenant_id: "T1".into(),
            agent_id: "A1".into(),
            active: true,
            created_at: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["callId"], "C1");
        assert_eq!(json["channelType"], "whatsapp");
    }

    #[tokio::test]
    async fn message_history_accumulates_under_session_lock() {
        let store = InMemoryConversationStore::new();
        let p = params("s1", ChannelType::Web);
        let output = crate::model::AudioOutput::new("s1", None);
        let session = CallSession::new(p, output);

        // Direct state manipulation mirrors what add_message does under the
        // lock without needing the full manager graph.
        {
            let mut state = session.state.lock().await;
            state
                .history
                .push(ConversationMessage::new(MessageRole::User, "hi"));
            state
                .history
                .push(ConversationMessage::new(MessageRole::Assistant, "hello"));
        }
        let state = session.state.lock().await;
        assert_eq!(state.history.len(), 2);
        drop(state);

        let id = store
            .ensure_conversation("T1", "A1", "web", "call-s1")
            .await
            .unwrap();
        store
            .append_message(&id, &ConversationMessage::new(MessageRole::User, "hi"))
            .await
            .unwrap();
        assert_eq!(store.get(&id).unwrap().messages.len(), 1);
    }
}
