//! Shared session-setup path.
//!
//! Runs on the pod that owns the session, off the request-handling thread:
//! answer the offer, attach media, open the provider session, arm the
//! greeting. WhatsApp, web and test calls share this spine; the channel
//! only decides how the answer reaches the caller and when the greeting
//! releases.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::agents::AgentConfig;
use crate::app::VoiceApp;
use crate::events::{Event, EventType};
use crate::model::{AudioOutput, ModelConnection, ModelSettings, OutputTarget};
use crate::session::{CallDirection, CallSession, ChannelType};
use crate::webrtc::InboundHooks;

/// How long a WhatsApp call waits for the accepted signal before greeting
/// anyway.
const ACCEPT_SIGNAL_DEADLINE: Duration = Duration::from_secs(30);

/// Full setup for inbound WhatsApp / web / test calls.
pub async fn run_inbound_setup(
    app: &Arc<VoiceApp>,
    session: &Arc<CallSession>,
    sdp_offer: &str,
) -> anyhow::Result<()> {
    if sdp_offer.trim().is_empty() {
        anyhow::bail!("task without an SDP offer");
    }
    let agent = app
        .agent_cache
        .get(&session.agent_id)
        .ok_or_else(|| anyhow::anyhow!("agent disappeared from cache: {}", session.agent_id))?;

    // Media first: negotiate and wire the outbound track.
    let hooks = build_inbound_hooks(app, session);
    let (answer, track_writer) = app
        .webrtc
        .process_sdp_offer(&session.id, sdp_offer, hooks)
        .await?;
    {
        let mut state = session.state.lock().await;
        state.track_writer = Some(Arc::clone(&track_writer));
    }
    session
        .output
        .set_target(OutputTarget::Opus(track_writer));

    // WhatsApp relays our answer through the provider.
    if session.channel_type == ChannelType::Whatsapp {
        if let Err(e) = app.wati.pre_accept_call(&session.call_id).await {
            tracing::warn!(session_id = %session.id, error = %e, "pre-accept failed");
        }
        app.wati.accept_call(&session.call_id, &answer).await?;
        tracing::info!(session_id = %session.id, call_id = %session.call_id, "call accepted");
    }

    // Provider session.
    let model = connect_model(app, session, &agent).await?;
    // Media and model are both up; the call is fully serviceable.
    app.event_bus
        .publish(Event::new(EventType::ConnectionReady, &session.id));

    // Prior turns (session recovery) are replayed into the provider.
    let history: Vec<_> = {
        let state = session.state.lock().await;
        state
            .history
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    };
    if !history.is_empty() {
        model.add_conversation_history(history).await?;
    }

    // Greeting release.
    match session.channel_type {
        ChannelType::Whatsapp => {
            model.enable_greeting_signal_control();
            arm_greeting_on_accept(app, session, &model);
            // The caller initiated this call and our accept connects the
            // media path, so the accepted signal follows immediately.
            app.event_bus
                .publish(Event::new(EventType::WhatsAppCallAccepted, &session.id));
        }
        _ => {
            // Web and test callers are present by definition.
            trigger_greeting(session, &model).await;
        }
    }
    Ok(())
}

/// Wait for the accepted signal, then release the greeting exactly once.
/// The watch is registered before this returns, so a signal published
/// right after arming cannot be missed. If the signal never arrives the
/// greeting goes out anyway — a silent call is the worst outcome.
pub fn arm_greeting_on_accept(
    app: &Arc<VoiceApp>,
    session: &Arc<CallSession>,
    model: &Arc<ModelConnection>,
) {
    let (handle, accepted_rx) = app
        .event_bus
        .watch_for(EventType::WhatsAppCallAccepted, &session.id);
    let app = Arc::clone(app);
    let session = Arc::clone(session);
    let model = Arc::clone(model);
    tokio::spawn(async move {
        let waited = tokio::time::timeout(ACCEPT_SIGNAL_DEADLINE, accepted_rx).await;
        app.event_bus.unsubscribe(handle);
        if waited.is_err() {
            if session.is_closed() {
                return;
            }
            tracing::warn!(
                session_id = %session.id,
                "no accepted signal within deadline; greeting anyway"
            );
        }
        trigger_greeting(&session, &model).await;
    });
}

/// CAS-guarded greeting release: exactly one trigger per session.
pub async fn trigger_greeting(session: &Arc<CallSession>, model: &Arc<ModelConnection>) {
    if !session.try_mark_greeting_sent() {
        return;
    }
    match model.trigger_greeting().await {
        Ok(true) => {
            tracing::info!(session_id = %session.id, "greeting released");
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(session_id = %session.id, error = %e, "greeting dispatch failed");
        }
    }
}

/// Open the provider session and wire it into the session manager.
pub async fn connect_model(
    app: &Arc<VoiceApp>,
    session: &Arc<CallSession>,
    agent: &AgentConfig,
) -> anyhow::Result<Arc<ModelConnection>> {
    let settings = build_model_settings(app, session, agent).await?;
    let (events_tx, events_rx) = mpsc::channel(256);
    let model = ModelConnection::connect(
        settings,
        &session.id,
        Arc::clone(&app.event_bus),
        Arc::clone(&session.output),
        events_tx,
    )
    .await?;
    app.sessions.attach_model(session, Arc::clone(&model), events_rx);
    Ok(model)
}

/// Resolve provider settings from the agent's prompt configuration.
pub async fn build_model_settings(
    app: &Arc<VoiceApp>,
    session: &Arc<CallSession>,
    agent: &AgentConfig,
) -> anyhow::Result<ModelSettings> {
    let (language, accent) = {
        let state = session.state.lock().await;
        (state.voice_language.clone(), state.accent.clone())
    };

    let outbound = session.direction == CallDirection::Outbound;
    let mut instructions = agent.prompt_config.system_instructions.clone();
    if outbound {
        if let Some(outbound_config) = &agent.outbound_prompt_config {
            if !outbound_config.system_instructions.is_empty() {
                instructions = outbound_config.system_instructions.clone();
            }
        }
    }
    if !agent.prompt_config.realtime.is_empty() {
        if !instructions.is_empty() {
            instructions.push_str("\n\n");
        }
        instructions.push_str(&agent.prompt_config.realtime);
    }

    let greeting = if outbound {
        agent
            .outbound_prompt_config
            .as_ref()
            .map(|c| c.greeting.as_str())
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| agent.greeting_for(&language))
            .to_owned()
    } else {
        agent.greeting_for(&language).to_owned()
    };

    ModelSettings::resolve(
        session.model_provider,
        &app.config,
        &agent.voice,
        &language,
        &accent,
        instructions,
        greeting,
    )
}

/// Hooks the RTP forwarder uses: the combined close/greeting gate, the PCM
/// sink into the model, and first-audio bookkeeping.
pub fn build_inbound_hooks(app: &Arc<VoiceApp>, session: &Arc<CallSession>) -> InboundHooks {
    let gate_session = Arc::clone(session);
    let sink_session = Arc::clone(session);
    let audio_session = Arc::clone(session);
    let event_bus = Arc::clone(&app.event_bus);
    InboundHooks {
        gate: Arc::new(move || {
            !gate_session.is_closed() && gate_session.should_forward_audio().0
        }),
        sink: Arc::new(move |pcm| {
            if let Some(model) = sink_session.model() {
                model.send_pcm(pcm);
            }
        }),
        sample_rate: session.model_provider.input_sample_rate(),
        on_first_audio: Arc::new(move || {
            audio_session.mark_inbound_audio();
            if audio_session.channel_type == ChannelType::Whatsapp {
                event_bus.publish(Event::new(
                    EventType::WhatsAppAudioReady,
                    &audio_session.id,
                ));
            }
        }),
    }
}

/// Keep the caller-facing output handle alive for LiveKit sessions too.
pub fn attach_pcm_output(output: &Arc<AudioOutput>, tx: mpsc::Sender<Vec<i16>>) {
    output.set_target(OutputTarget::Pcm(tx));
}
