//! Gemini Live WebSocket session (BidiGenerateContent).
//!
//! Protocol:
//! 1. **Connect** — WebSocket to the BidiGenerateContent endpoint, API key
//!    in the query string.
//! 2. **Setup** — first frame carries model, generation config, system
//!    instruction and VAD settings.
//! 3. **Stream** — `realtimeInput.audio` (base64 PCM16 16 kHz) up,
//!    `serverContent.modelTurn` inline audio (base64 PCM16 24 kHz) down.
//!
//! Gemini sends all messages as WebSocket **Binary** frames, including JSON
//! control messages such as `setupComplete`; binary frames that decode as
//! UTF-8 starting with `{` are parsed as server messages.

use std::sync::Arc;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::store::MessageRole;

use super::{
    AudioOutput, ModelConnection, ModelEvent, ModelSettings, Pcm16Framer, ProviderCommand,
};

const BIDI_PATH: &str =
    "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Caller audio format on the Gemini ingress.
const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;
type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

// ── Setup message ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SetupMessage {
    setup: SetupPayload,
}

#[derive(Debug, Serialize)]
struct SetupPayload {
    model: String,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(rename = "realtimeInputConfig")]
    realtime_input_config: RealtimeInputConfig,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct RealtimeInputConfig {
    #[serde(rename = "automaticActivityDetection")]
    automatic_activity_detection: VadConfig,
}

#[derive(Debug, Serialize)]
struct VadConfig {
    disabled: bool,
    #[serde(rename = "startOfSpeechSensitivity")]
    start_sensitivity: &'static str,
    #[serde(rename = "endOfSpeechSensitivity")]
    end_sensitivity: &'static str,
    #[serde(rename = "prefixPaddingMs")]
    prefix_padding_ms: u32,
    #[serde(rename = "silenceDurationMs")]
    silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            start_sensitivity: "START_SENSITIVITY_LOW",
            end_sensitivity: "END_SENSITIVITY_LOW",
            prefix_padding_ms: 100,
            silence_duration_ms: 500,
        }
    }
}

fn build_setup_message(settings: &ModelSettings) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", settings.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_owned()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: if settings.voice.is_empty() {
                                "Aoede".to_owned()
                            } else {
                                settings.voice.clone()
                            },
                        },
                    },
                },
            },
            system_instruction: (!settings.instructions.is_empty()).then(|| SystemInstruction {
                parts: vec![TextPart {
                    text: settings.instructions.clone(),
                }],
            }),
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: VadConfig::default(),
            },
        },
    }
}

// ── Streaming messages ─────────────────────────────────────────────

fn build_audio_message(pcm: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "realtimeInput": {
            "audio": {
                "mimeType": INPUT_AUDIO_MIME,
                "data": base64::engine::general_purpose::STANDARD.encode(pcm),
            }
        }
    })
}

/// A complete client turn; `turn_complete` makes the model respond now.
fn build_client_turn(role: MessageRole, text: &str, turn_complete: bool) -> serde_json::Value {
    let role = match role {
        MessageRole::Assistant => "model",
        _ => "user",
    };
    serde_json::json!({
        "clientContent": {
            "turns": [{
                "role": role,
                "parts": [{"text": text}],
            }],
            "turnComplete": turn_complete,
        }
    })
}

// ── Session ────────────────────────────────────────────────────────

/// Connect, send the setup frame, and spawn the socket loops.
pub(super) async fn spawn_session(
    settings: ModelSettings,
    connection: Arc<ModelConnection>,
    command_rx: mpsc::Receiver<ProviderCommand>,
    output: Arc<AudioOutput>,
    events_tx: mpsc::Sender<ModelEvent>,
) -> anyhow::Result<()> {
    let session_id = connection.session_id().to_owned();
    let url = format!("{}{BIDI_PATH}?key={}", settings.base_url, settings.api_key);

    let request = url
        .into_client_request()
        .map_err(|e| anyhow::anyhow!("failed to build Gemini Live request: {e}"))?;
    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to Gemini Live: {e}"))?;
    let (ws_sender, ws_receiver) = ws_stream.split();
    let ws_sender = Arc::new(Mutex::new(ws_sender));

    let setup = build_setup_message(&settings);
    {
        let mut sender = ws_sender.lock().await;
        sender
            .send(WsMessage::Text(serde_json::to_string(&setup)?.into()))
            .await
            .map_err(|e| anyhow::anyhow!("failed to send Gemini setup: {e}"))?;
    }
    tracing::debug!(session_id = %session_id, model = %settings.model, "Gemini setup sent");

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

async fn outbound_loop(
    mut command_rx: mpsc::Receiver<ProviderCommand>,
    ws_sender: Arc<Mutex<WsSink>>,
    greeting_instructions: String,
    session_id: String,
) {
    while let Some(command) = command_rx.recv().await {
        let messages: Vec<serde_json::Value> = match command {
            ProviderCommand::Pcm(pcm) => vec![build_audio_message(&pcm)],
            ProviderCommand::History(turns) => turns
                .into_iter()
                .map(|(role, content)| build_client_turn(role, &content, false))
                .collect(),
            ProviderCommand::TriggerGreeting => {
                tracing::info!(session_id = %session_id, "dispatching greeting to Gemini");
                vec![build_client_turn(MessageRole::System, &greeting_instructions, true)]
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
                tracing::warn!(session_id = %session_id, "Gemini socket send failed; stopping");
                return;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "Gemini outbound loop terminated");
}

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
        let text = match message {
            Ok(WsMessage::Text(text)) => text.to_string(),
            // Gemini wraps JSON in binary frames.
            Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) if text.trim_start().starts_with('{') => text,
                _ => continue,
            },
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(session_id = %session_id, frame = ?frame, "Gemini closed the socket");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Gemini socket error");
                let _ = events_tx
                    .send(ModelEvent::Error(format!("socket error: {e}")))
                    .await;
                break;
            }
        };

        for event in parse_server_message(&text) {
            match event {
                ModelEvent::Audio(pcm) => {
                    audio_deltas += 1;
                    if audio_deltas == 1 {
                        let _ = events_tx.try_send(ModelEvent::AudioStarted);
                    }
                    for frame in framer.push(&pcm) {
                        super::openai::write_model_frame(&output, &mut encoder, &frame, &session_id)
                            .await;
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

    if let Some(frame) = framer.flush() {
        super::openai::write_model_frame(&output, &mut encoder, &frame, &session_id).await;
    }
    connection.fire_close();
    tracing::debug!(session_id = %session_id, "Gemini inbound loop terminated");
}

// ── Server message parsing ─────────────────────────────────────────

/// One server frame can carry several events (audio chunks, transcripts and
/// turn markers arrive together).
fn parse_server_message(json_text: &str) -> Vec<ModelEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(ModelEvent::Error(format!("unparseable Gemini message: {e}")));
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(ModelEvent::Ready);
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ModelEvent::Interrupted);
        }
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(|v| v.as_array()) {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    if let Ok(pcm) = base64::engine::general_purpose::STANDARD.decode(data) {
                        events.push(ModelEvent::Audio(pcm));
                    }
                }
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        events.push(ModelEvent::AssistantTranscript(text.to_owned()));
                    }
                }
            }
        }
        if let Some(text) = content.pointer("/outputTranscription/text").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(ModelEvent::AssistantTranscript(text.to_owned()));
            }
        }
        if let Some(text) = content.pointer("/inputTranscription/text").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(ModelEvent::UserTranscript(text.to_owned()));
            }
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ModelEvent::ResponseDone);
        }
    }

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown Gemini error");
        events.push(ModelEvent::Error(message.to_owned()));
    }

    events
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelProvider;

    fn settings() -> ModelSettings {
        ModelSettings {
            provider: ModelProvider::Gemini,
            api_key: "key".into(),
            base_url: "wss://generativelanguage.googleapis.com".into(),
            model: "gemini-2.0-flash-live-001".into(),
            voice: "".into(),
            language: "en".into(),
            accent: "neutral".into(),
            instructions: "You answer the phone.".into(),
            greeting_instructions: "Say hello.".into(),
        }
    }

    #[test]
    fn setup_message_shape() {
        let setup = serde_json::to_value(build_setup_message(&settings())).unwrap();
        assert_eq!(setup["setup"]["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        // Empty voice falls back to the default prebuilt voice.
        assert_eq!(
            setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
        assert_eq!(
            setup["setup"]["systemInstruction"]["parts"][0]["text"],
            "You answer the phone."
        );
        assert_eq!(
            setup["setup"]["realtimeInputConfig"]["automaticActivityDetection"]["disabled"],
            false
        );
    }

    #[test]
    fn audio_message_carries_mime_and_base64() {
        let message = build_audio_message(&[0u8, 1, 2, 3]);
        assert_eq!(message["realtimeInput"]["audio"]["mimeType"], INPUT_AUDIO_MIME);
        let data = message["realtimeInput"]["audio"]["data"].as_str().unwrap();
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(data).unwrap(),
            vec![0u8, 1, 2, 3]
        );
    }

    #[test]
    fn client_turn_roles() {
        let turn = build_client_turn(MessageRole::Assistant, "prior reply", false);
        assert_eq!(turn["clientContent"]["turns"][0]["role"], "model");
        assert_eq!(turn["clientContent"]["turnComplete"], false);

        let turn = build_client_turn(MessageRole::System, "greet", true);
        assert_eq!(turn["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(turn["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn parse_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#);
        assert!(matches!(events[0], ModelEvent::Ready));
    }

    #[test]
    fn parse_model_turn_audio_and_text() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([9u8, 9]);
        let json = format!(
            r#"{{"serverContent": {{"modelTurn": {{"parts": [
                {{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{b64}"}}}},
                {{"text": "hello there"}}
            ]}}, "turnComplete": true}}}}"#
        );
        let events = parse_server_message(&json);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ModelEvent::Audio(pcm) if pcm == &[9, 9]));
        assert!(matches!(&events[1], ModelEvent::AssistantTranscript(t) if t == "hello there"));
        assert!(matches!(events[2], ModelEvent::ResponseDone));
    }

    #[test]
    fn parse_interruption() {
        let events = parse_server_message(r#"{"serverContent": {"interrupted": true}}"#);
        assert!(matches!(events[0], ModelEvent::Interrupted));
    }

    #[test]
    fn parse_transcriptions() {
        let events = parse_server_message(
            r#"{"serverContent": {"inputTranscription": {"text": "hi"}, "outputTranscription": {"text": "hey"}}}"#,
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, ModelEvent::UserTranscript(t) if t == "hi")));
        assert!(events
            .iter()
            .any(|e| matches!(e, ModelEvent::AssistantTranscript(t) if t == "hey")));
    }

    #[test]
    fn parse_error() {
        let events = parse_server_message(r#"{"error": {"message": "quota exceeded"}}"#);
        assert!(matches!(&events[0], ModelEvent::Error(m) if m.contains("quota")));
    }
}
