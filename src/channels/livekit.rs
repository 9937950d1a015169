//! LiveKit room adapter.
//!
//! The gateway is a bot participant: it creates the room, joins it, puts
//! model audio on a published track, and feeds participant audio to the
//! model. Room recordings go through LiveKit egress rather than the
//! in-process pipeline, so these sessions skip the recorder and the usage
//! emitters.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use livekit::options::TrackPublishOptions;
use livekit::prelude::*;
use livekit::webrtc::audio_frame::AudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit_api::access_token::{AccessToken, VideoGrants};
use livekit_api::services::room::{CreateRoomOptions, RoomClient};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::app::VoiceApp;
use crate::config::{LiveKitConfig, EGRESS_START_DEADLINE};
use crate::error::GatewayError;
use crate::model::ModelProvider;
use crate::registry::tasks::{TaskKind, TaskMessage};
use crate::session::{CallDirection, CallSession, ChannelType, SessionParams};

use super::setup;
use super::{connection_id_for, CreateRoomRequest, CreateRoomResponse, JoinRoomRequest};

/// One live room bridged by this pod.
pub struct LiveKitCall {
    pub room_name: String,
    pub connection_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub egress_id: Mutex<Option<String>>,
    /// Closed (notified) once the bot participant is fully joined.
    pub ready: Arc<Notify>,
}

fn http_url(ws_url: &str) -> String {
    ws_url
        .replacen("wss://", "https://", 1)
        .replacen("ws://", "http://", 1)
}

fn require_config(app: &VoiceApp) -> Result<&LiveKitConfig, GatewayError> {
    app.config
        .livekit
        .as_ref()
        .ok_or_else(|| GatewayError::Config("LiveKit is not configured".into()))
}

fn participant_token(
    config: &LiveKitConfig,
    room_name: &str,
    identity: &str,
    name: &str,
) -> Result<String, GatewayError> {
    AccessToken::with_api_key(&config.api_key, &config.api_secret)
        .with_identity(identity)
        .with_name(name)
        .with_grants(VideoGrants {
            room_join: true,
            room: room_name.to_owned(),
            ..Default::default()
        })
        .to_jwt()
        .map_err(|e| GatewayError::Dependency(format!("token mint failed: {e}")))
}

// ── HTTP adapters ──────────────────────────────────────────────────

/// `POST /livekit/create-room`.
pub async fn handle_create_room(
    app: &Arc<VoiceApp>,
    request: CreateRoomRequest,
) -> Result<CreateRoomResponse, GatewayError> {
    if request.participant_name.trim().is_empty() {
        return Err(GatewayError::Validation("participantName is required".into()));
    }
    let config = require_config(app)?;
    let agent = app
        .agent_cache
        .get(&request.agent_id)
        .ok_or_else(|| GatewayError::NotFound(format!("unknown agent: {}", request.agent_id)))?;

    let room_name = format!("astra_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let room_client = RoomClient::with_api_key(
        &http_url(&config.url),
        &config.api_key,
        &config.api_secret,
    );
    room_client
        .create_room(&room_name, CreateRoomOptions::default())
        .await
        .map_err(|e| GatewayError::Dependency(format!("room create failed: {e}")))?;

    let access_token = participant_token(
        config,
        &room_name,
        &request.participant_name,
        &request.participant_name,
    )?;

    let connection_id = connection_id_for("lk", &room_name);
    let tenant_id = request
        .tenant_id
        .clone()
        .unwrap_or_else(|| agent.tenant_id.clone());
    let session = app
        .sessions
        .create_session(SessionParams {
            id: connection_id.clone(),
            call_id: room_name.clone(),
            channel_type: ChannelType::Livekit,
            direction: CallDirection::Inbound,
            from: request.participant_name.clone(),
            to: agent.name.clone(),
            tenant_id,
            agent_id: agent.id.clone(),
            text_agent_id: agent.text_agent_id.clone(),
            voice_language: request
                .voice_language
                .clone()
                .unwrap_or_else(|| agent.language.clone()),
            accent: String::new(),
            model_provider: ModelProvider::OpenAi,
        })
        .await
        .map_err(GatewayError::Internal)?;

    app.livekit_rooms.lock().insert(
        room_name.clone(),
        Arc::new(LiveKitCall {
            room_name: room_name.clone(),
            connection_id: connection_id.clone(),
            created_at: chrono::Utc::now(),
            egress_id: Mutex::new(None),
            ready: Arc::new(Notify::new()),
        }),
    );

    if let Err(e) = app.sessions.initialize_conversation(&session).await {
        tracing::warn!(session_id = %connection_id, error = %e, "conversation init failed");
    }

    app.task_bus
        .publish(&TaskMessage {
            kind: TaskKind::LivekitRoom,
            connection_id: connection_id.clone(),
            payload: serde_json::json!({"roomName": room_name}),
        })
        .await
        .map_err(GatewayError::Internal)?;

    Ok(CreateRoomResponse {
        connection_id,
        room_name,
        access_token,
        server_url: config.url.clone(),
        status: "created",
    })
}

/// `POST /livekit/join-room` — mint a token for an existing room.
pub async fn handle_join_room(
    app: &Arc<VoiceApp>,
    request: JoinRoomRequest,
) -> Result<serde_json::Value, GatewayError> {
    let config = require_config(app)?;
    if !app.livekit_rooms.lock().contains_key(&request.room_name) {
        return Err(GatewayError::NotFound(format!(
            "unknown room: {}",
            request.room_name
        )));
    }
    let token = participant_token(
        config,
        &request.room_name,
        &request.participant_name,
        &request.participant_name,
    )?;
    Ok(serde_json::json!({
        "code": 200,
        "message": "ok",
        "accessToken": token,
        "serverUrl": config.url,
    }))
}

/// `POST /livekit/end-call` — tear the room and session down.
pub async fn handle_end_call(
    app: &Arc<VoiceApp>,
    connection_id: Option<&str>,
    room_name: Option<&str>,
) {
    let call = {
        let rooms = app.livekit_rooms.lock();
        match (connection_id, room_name) {
            (_, Some(room)) => rooms.get(room).cloned(),
            (Some(id), None) => rooms.values().find(|c| c.connection_id == id).cloned(),
            _ => None,
        }
    };
    let Some(call) = call else {
        if let Some(id) = connection_id {
            app.sessions.notify_cleanup(id, "end-call requested").await;
        }
        return;
    };

    app.sessions
        .notify_cleanup(&call.connection_id, "end-call requested")
        .await;
    app.livekit_rooms.lock().remove(&call.room_name);

    if let Some(config) = app.config.livekit.as_ref() {
        let room_client = RoomClient::with_api_key(
            &http_url(&config.url),
            &config.api_key,
            &config.api_secret,
        );
        if let Err(e) = room_client.delete_room(&call.room_name).await {
            tracing::warn!(room = %call.room_name, error = %e, "room delete failed");
        }
    }
}

/// `POST /livekit/webhook` — room lifecycle notifications.
pub async fn handle_webhook(app: &Arc<VoiceApp>, payload: &serde_json::Value) {
    let event = payload.get("event").and_then(|v| v.as_str()).unwrap_or("");
    let room = payload
        .pointer("/room/name")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match event {
        "room_finished" | "participant_left" => {
            let call = app.livekit_rooms.lock().get(room).cloned();
            if let Some(call) = call {
                app.sessions
                    .notify_cleanup(&call.connection_id, "room finished")
                    .await;
                app.livekit_rooms.lock().remove(room);
            }
        }
        other => {
            tracing::debug!(event = other, room, "unhandled LiveKit webhook");
        }
    }
}

// ── Bot participant ────────────────────────────────────────────────

/// Owning-pod setup: join as the bot, bridge audio both ways, start
/// egress, and signal readiness.
pub async fn run_room_setup(
    app: &Arc<VoiceApp>,
    session: &Arc<CallSession>,
    room_name: &str,
) -> anyhow::Result<()> {
    let config = app
        .config
        .livekit
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("LiveKit is not configured"))?;
    let agent = app
        .agent_cache
        .get(&session.agent_id)
        .ok_or_else(|| anyhow::anyhow!("agent disappeared from cache: {}", session.agent_id))?;
    let call = app
        .livekit_rooms
        .lock()
        .get(room_name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("unknown room: {room_name}"))?;

    let suffix = session.id.rsplit('_').next().unwrap_or("bot");
    let bot_identity = format!("astra-agent-{suffix}");
    let bot_token = AccessToken::with_api_key(&config.api_key, &config.api_secret)
        .with_identity(&bot_identity)
        .with_name("Astra Agent")
        .with_grants(VideoGrants {
            room_join: true,
            room: room_name.to_owned(),
            ..Default::default()
        })
        .to_jwt()
        .map_err(|e| anyhow::anyhow!("bot token mint failed: {e}"))?;

    let (room, room_events) = Room::connect(&config.url, &bot_token, RoomOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("room connect failed: {e}"))?;
    tracing::info!(session_id = %session.id, room = room_name, "bot joined room");

    // Published track carrying model audio.
    let sample_rate = session.model_provider.output_sample_rate();
    let audio_source = NativeAudioSource::new(AudioSourceOptions::default(), sample_rate, 1, 100);
    let local_track = LocalAudioTrack::create_audio_track(
        "agent-audio",
        RtcAudioSource::Native(audio_source.clone()),
    );
    room.local_participant()
        .publish_track(LocalTrack::Audio(local_track), TrackPublishOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("track publish failed: {e}"))?;

    // Model PCM → published track.
    let (pcm_tx, mut pcm_rx) = mpsc::channel::<Vec<i16>>(64);
    setup::attach_pcm_output(&session.output, pcm_tx);
    {
        let audio_source = audio_source.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            while let Some(samples) = pcm_rx.recv().await {
                let samples_per_channel = samples.len() as u32;
                let frame = AudioFrame {
                    data: Cow::Owned(samples),
                    sample_rate,
                    num_channels: 1,
                    samples_per_channel,
                };
                if let Err(e) = audio_source.capture_frame(&frame).await {
                    tracing::warn!(session_id = %session_id, error = %e, "room audio push failed");
                    break;
                }
            }
        });
    }

    let model = setup::connect_model(app, session, &agent).await?;
    model.enable_greeting_signal_control();

    if config.egress_bucket.is_some() {
        match start_room_egress(config, room_name).await {
            Ok(egress_id) => {
                tracing::info!(room = room_name, egress_id = %egress_id, "room egress started");
                *call.egress_id.lock() = Some(egress_id);
            }
            Err(e) => {
                tracing::warn!(room = room_name, error = %e, "room egress failed to start");
            }
        }
    }

    session.mark_connected();
    call.ready.notify_waiters();
    app.event_bus.publish(crate::events::Event::new(
        crate::events::EventType::ConnectionReady,
        &session.id,
    ));

    spawn_room_event_loop(app, session, &model, room, room_events);
    Ok(())
}

/// Room event loop: bridge participant audio in, release the greeting when
/// someone is there, tear down when the room empties.
fn spawn_room_event_loop(
    app: &Arc<VoiceApp>,
    session: &Arc<CallSession>,
    model: &Arc<crate::model::ModelConnection>,
    room: Room,
    mut room_events: mpsc::UnboundedReceiver<RoomEvent>,
) {
    let app = Arc::clone(app);
    let session = Arc::clone(session);
    let model = Arc::clone(model);
    tokio::spawn(async move {
        // Holding the handle keeps the bot in the room.
        let _room = room;
        while let Some(event) = room_events.recv().await {
            match event {
                RoomEvent::ParticipantConnected(participant) => {
                    tracing::info!(
                        session_id = %session.id,
                        participant = %participant.identity(),
                        "participant joined"
                    );
                    setup::trigger_greeting(&session, &model).await;
                }
                RoomEvent::TrackSubscribed { track, participant, .. } => {
                    if let RemoteTrack::Audio(audio_track) = track {
                        tracing::info!(
                            session_id = %session.id,
                            participant = %participant.identity(),
                            "participant audio subscribed"
                        );
                        setup::trigger_greeting(&session, &model).await;
                        spawn_input_bridge(&session, audio_track);
                    }
                }
                RoomEvent::ParticipantDisconnected(participant) => {
                    tracing::info!(
                        session_id = %session.id,
                        participant = %participant.identity(),
                        "participant left; ending session"
                    );
                    app.sessions
                        .notify_cleanup(&session.id, "participant left")
                        .await;
                    return;
                }
                RoomEvent::Disconnected { reason } => {
                    tracing::info!(
                        session_id = %session.id,
                        reason = ?reason,
                        "room disconnected"
                    );
                    app.sessions
                        .notify_cleanup(&session.id, "room disconnected")
                        .await;
                    return;
                }
                _ => {}
            }
        }
    });
}

/// Participant audio → PCM16 at the provider rate → model, behind the
/// session's forwarding gate.
fn spawn_input_bridge(session: &Arc<CallSession>, track: RemoteAudioTrack) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let rate = session.model_provider.input_sample_rate() as i32;
        let mut stream = NativeAudioStream::new(track.rtc_track(), rate, 1);
        let mut first = true;
        while let Some(frame) = stream.next().await {
            if session.is_closed() {
                break;
            }
            if first {
                first = false;
                session.mark_inbound_audio();
            }
            if !session.should_forward_audio().0 {
                continue;
            }
            let Some(model) = session.model() else { continue };
            let mut bytes = Vec::with_capacity(frame.data.len() * 2);
            for sample in frame.data.iter() {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            model.send_pcm(bytes);
        }
        tracing::debug!(session_id = %session.id, "room input bridge ended");
    });
}

/// Start an audio-only room-composite egress through the Twirp surface,
/// bounded by the egress deadline.
async fn start_room_egress(config: &LiveKitConfig, room_name: &str) -> anyhow::Result<String> {
    let bucket = config
        .egress_bucket
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no egress bucket configured"))?;
    let token = AccessToken::with_api_key(&config.api_key, &config.api_secret)
        .with_identity("astra-egress")
        .with_grants(VideoGrants {
            room_record: true,
            room: room_name.to_owned(),
            ..Default::default()
        })
        .to_jwt()
        .map_err(|e| anyhow::anyhow!("egress token mint failed: {e}"))?;

    let url = format!("{}/twirp/livekit.Egress/StartRoomCompositeEgress", http_url(&config.url));
    let body = serde_json::json!({
        "room_name": room_name,
        "audio_only": true,
        "file_outputs": [{
            "filepath": format!("{room_name}/recording.ogg"),
            "gcp": {"bucket": bucket},
        }],
    });
    let client = reqwest::Client::new();
    let response = tokio::time::timeout(
        EGRESS_START_DEADLINE,
        client.post(&url).bearer_auth(token).json(&body).send(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("egress start exceeded {EGRESS_START_DEADLINE:?}"))??
    .error_for_status()?;
    let parsed: serde_json::Value = response.json().await?;
    parsed
        .get("egress_id")
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned)
        .ok_or_else(|| anyhow::anyhow!("egress response without egress_id"))
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_becomes_http() {
        assert_eq!(http_url("wss://lk.example"), "https://lk.example");
        assert_eq!(http_url("ws://localhost:7880"), "http://localhost:7880");
        assert_eq!(http_url("https://lk.example"), "https://lk.example");
    }

    #[test]
    fn create_room_response_shape() {
        let response = CreateRoomResponse {
            connection_id: "lk_astra_12345678_aabbccdd".into(),
            room_name: "astra_12345678".into(),
            access_token: "jwt".into(),
            server_url: "wss://lk.example".into(),
            status: "created",
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["roomName"], "astra_12345678");
        assert_eq!(json["accessToken"], "jwt");
        assert_eq!(json["serverUrl"], "wss://lk.example");
        assert_eq!(json["status"], "created");
    }
}
