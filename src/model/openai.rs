//! OpenAI Realtime WebSocket session.
//!
//! Protocol:
//! 1. **Connect** — WebSocket to `{base}?model=...` with bearer auth.
//! 2. **Configure** — `session.update` with instructions, PCM16 in/out and
//!    server VAD.
//! 3. **Stream** — `input_audio_buffer.append` (base64 PCM16 24 kHz) up,
//!    `response.audio.delta` (base64 PCM16 24 kHz) down.
//! 4. **Greeting** — a `response.create` carrying the greeting
//!    instructions, sent when the gate releases.

use std::sync::Arc;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::store::MessageRole;

use super::{
    AudioOutput, ModelConnection, ModelEvent, ModelSettings, Pcm16Framer, ProviderCommand,
};

/// Realtime model requested when the deployment does not override it.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;
type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Connect, configure, and spawn the socket loops for one session.
pub(super) async fn spawn_session(
    settings: ModelSettings,
    connection: Arc<ModelConnection>,
    command_rx: mpsc::Receiver<ProviderCommand>,
    output: Arc<AudioOutput>,
    events_tx: mpsc::Sender<ModelEvent>,
) -> anyhow::Result<()> {
    let session_id = connection.session_id().to_owned();
    let url = format!("{}?model={}", settings.base_url, settings.model);

    let mut request = url
        .into_client_request()
        .map_err(|e| anyhow::anyhow!("failed to build realtime request: {e}"))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", settings.api_key)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid auth header: {e}"))?,
    );
    request.headers_mut().insert(
        "OpenAI-Beta",
        "realtime=v1"
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid header: {e}"))?,
    );

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to OpenAI Realtime: {e}"))?;
    let (ws_sender, ws_receiver) = ws_stream.split();
    let ws_sender = Arc::new(Mutex::new(ws_sender));

    // Configure the session before any audio flows.
    let update = build_session_update(&settings);
    {
        let mut sender = ws_sender.lock().await;
        sender
            .send(WsMessage::Text(serde_json::to_string(&update)?.into()))
            .await
            .map_err(|e| anyhow::anyhow!("failed to send session.update: {e}"))?;
    }
    tracing::debug!(session_id = %session_id, "OpenAI session.update sent");

    let greeting = settings.greeting_instructions.clone();
    {
        let ws_sender = Arc::clone(&ws_sender);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            outbound_loop(command_rx, ws_sender, greeting, session_id).await;
        });
    }
    {
        let connection = Arc::clone(&connection);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            inbound_loop(ws_receiver, connection, output, events_tx, session_id).await;
        });
    }
    Ok(())
}

/// Encode commands onto the socket.
async fn outbound_loop(
    mut command_rx: mpsc::Receiver<ProviderCommand>,
    ws_sender: Arc<Mutex<WsSink>>,
    greeting_instructions: String,
    session_id: String,
) {
    let mut audio_chunks: u64 = 0;

    while let Some(command) = command_rx.recv().await {
        let messages: Vec<serde_json::Value> = match command {
            ProviderCommand::Pcm(pcm) => {
                audio_chunks += 1;
                if audio_chunks == 1 {
                    tracing::info!(session_id = %session_id, "first caller audio chunk to OpenAI");
                }
                let b64 = base64::engine::general_purpose::STANDARD.encode(&pcm);
                vec![serde_json::json!({
                    "type": "input_audio_buffer.append",
                    "audio": b64,
                })]
            }
            ProviderCommand::History(turns) => turns
                .into_iter()
                .map(|(role, content)| conversation_item(role, &content))
                .collect(),
            ProviderCommand::TriggerGreeting => {
                tracing::info!(session_id = %session_id, "dispatching greeting to OpenAI");
                vec![serde_json::json!({
                    "type": "response.create",
                    "response": {
                        "instructions": greeting_instructions,
                    }
                })]
            }
            ProviderCommand::Close => {
                let mut sender = ws_sender.lock().await;
                let _ = sender.send(WsMessage::Close(None)).await;
                break;
            }
        };

        let mut sender = ws_sender.lock().await;
        for message in messages {
            let Ok(json) = serde_json::to_string(&message) else { continue };
            if sender.send(WsMessage::Text(json.into())).await.is_err() {
                tracing::warn!(session_id = %session_id, "OpenAI socket send failed; stopping");
                return;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "OpenAI outbound loop terminated");
}

/// Decode server events; route audio to the egress and the rest upward.
async fn inbound_loop(
    mut ws_receiver: WsStream,
    connection: Arc<ModelConnection>,
    output: Arc<AudioOutput>,
    events_tx: mpsc::Sender<ModelEvent>,
    session_id: String,
) {
    let mut framer = Pcm16Framer::new(connection.provider().output_sample_rate(), 20);
    let mut encoder = match opus::Encoder::new(
        connection.provider().output_sample_rate(),
        opus::Channels::Mono,
        opus::Application::Voip,
    ) {
        Ok(encoder) => encoder,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "opus encoder init failed");
            connection.fire_close();
            return;
        }
    };
    let mut audio_deltas: u64 = 0;

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                for event in parse_server_event(&text) {
                    match event {
                        ModelEvent::Audio(pcm) => {
                            audio_deltas += 1;
                            if audio_deltas == 1 {
                                let _ = events_tx.try_send(ModelEvent::AudioStarted);
                            }
                            for frame in framer.push(&pcm) {
                                write_model_frame(&output, &mut encoder, &frame, &session_id).await;
                            }
                        }
                        other => {
                            if events_tx.send(other).await.is_err() {
                                tracing::debug!(
                                    session_id = %session_id,
                                    "model event receiver dropped; stopping inbound loop"
                                );
                                connection.fire_close();
                                return;
                            }
                        }
                    }
                }
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(session_id = %session_id, frame = ?frame, "OpenAI closed the socket");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "OpenAI socket error");
                let _ = events_tx
                    .send(ModelEvent::Error(format!("socket error: {e}")))
                    .await;
                break;
            }
        }
    }

    // Whatever remains is flushed so the tail of the last response is heard.
    if let Some(frame) = framer.flush() {
        write_model_frame(&output, &mut encoder, &frame, &session_id).await;
    }
    connection.fire_close();
    tracing::debug!(session_id = %session_id, "OpenAI inbound loop terminated");
}

pub(super) async fn write_model_frame(
    output: &Arc<AudioOutput>,
    encoder: &mut opus::Encoder,
    frame: &[i16],
    session_id: &str,
) {
    if output.wants_opus() {
        match encoder.encode_vec(frame, 4000) {
            Ok(payload) => {
                if let Err(e) = output.write_opus_frame(payload.into()).await {
                    tracing::warn!(session_id = %session_id, error = %e, "opus frame write failed");
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "opus encode failed");
            }
        }
    } else {
        output.write_pcm(frame.to_vec()).await;
    }
}

// ── Message builders ───────────────────────────────────────────────

/// The `session.update` configuring instructions, audio formats and VAD.
fn build_session_update(settings: &ModelSettings) -> serde_json::Value {
    serde_json::json!({
        "type": "session.update",
        "session": {
            "instructions": settings.instructions,
            "voice": settings.voice,
            "modalities": ["audio", "text"],
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": {
                "model": "gpt-4o-mini-transcribe"
            },
            "turn_detection": {
                "type": "server_vad",
                "silence_duration_ms": 500
            }
        }
    })
}

/// A `conversation.item.create` priming one prior turn.
fn conversation_item(role: MessageRole, content: &str) -> serde_json::Value {
    let content_type = match role {
        MessageRole::User => "input_text",
        _ => "text",
    };
    serde_json::json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": role.as_str(),
            "content": [{
                "type": content_type,
                "text": content,
            }]
        }
    })
}

// ── Server event parsing ───────────────────────────────────────────

/// Parse one server frame into provider-agnostic events.
fn parse_server_event(json_text: &str) -> Vec<ModelEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(ModelEvent::Error(format!("unparseable OpenAI event: {e}")));
            return events;
        }
    };
    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "session.created" | "session.updated" => events.push(ModelEvent::Ready),
        "response.audio.delta" => {
            if let Some(delta) = value.get("delta").and_then(|v| v.as_str()) {
                if let Ok(pcm) = base64::engine::general_purpose::STANDARD.decode(delta) {
                    events.push(ModelEvent::Audio(pcm));
                }
            }
        }
        "response.audio_transcript.done" => {
            if let Some(text) = value.get("transcript").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(ModelEvent::AssistantTranscript(text.to_owned()));
                }
            }
        }
        "conversation.item.input_audio_transcription.completed" => {
            if let Some(text) = value.get("transcript").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(ModelEvent::UserTranscript(text.to_owned()));
                }
            }
        }
        "response.done" => events.push(ModelEvent::ResponseDone),
        "response.cancelled" => events.push(ModelEvent::Interrupted),
        "error" => {
            let message = value
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown OpenAI error");
            events.push(ModelEvent::Error(message.to_owned()));
        }
        _ => {
            tracing::trace!(event_type = event_type, "unhandled OpenAI event");
        }
    }
    events
}

// ── Tests ──────────────────────────────────────────────────────────
