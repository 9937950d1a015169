//! Channel adapters.
//!
//! Three inbound shapes (WATI WhatsApp calls, LiveKit rooms, direct WebRTC
//! web/test clients) and one outbound shape (initiate → permission → SDP →
//! call-status). Every adapter validates its payload, creates and registers
//! the session, and pushes the heavy setup onto the task bus so the owning
//! pod does the media work.

pub mod livekit;
pub mod outbound;
pub mod setup;
pub mod wati;

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::app::VoiceApp;
use crate::registry::tasks::{TaskKind, TaskMessage};

// ── Wire DTOs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCallRequest {
    pub call_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub sdp: String,
    pub agent_id: String,
    #[serde(default)]
    pub business_number: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub accent: Option<String>,
    #[serde(default)]
    pub model_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCallResponse {
    pub code: u16,
    pub message: String,
    pub connection_id: String,
    pub call_id: String,
    pub sdp_answer: String,
    pub relay_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateCallRequest {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundInitiateRequest {
    pub waid: String,
    #[serde(default)]
    pub channel_phone_number: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub voice_language: Option<String>,
    #[serde(default)]
    pub accent: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundInitiateResponse {
    pub call_id: String,
    pub connection_id: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionWebhook {
    pub waid: String,
    #[serde(default)]
    pub has_permission: bool,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpAnswerWebhook {
    pub call_id: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusWebhook {
    pub call_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub participant_name: String,
    pub agent_id: String,
    #[serde(default)]
    pub voice_language: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub connection_id: String,
    pub room_name: String,
    pub access_token: String,
    pub server_url: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_name: String,
    pub participant_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallRequest {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub room_name: Option<String>,
}

// ── Connection ids ─────────────────────────────────────────────────

/// `{prefix}_{call_id}_{8 hex chars}`.
pub fn connection_id_for(prefix: &str, call_id: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{prefix}_{call_id}_{suffix:08x}")
}

// ── Task dispatch ──────────────────────────────────────────────────

/// Entry point of the task-bus subscriber: act only on sessions this pod
/// owns; the owning pod receives the same fan-out message.
pub async fn dispatch_task(app: Arc<VoiceApp>, task: TaskMessage) {
    let Some(session) = app.sessions.get(&task.connection_id) else {
        tracing::debug!(
            task = task.kind.as_str(),
            connection_id = %task.connection_id,
            "task for a session this pod does not own; dropped"
        );
        return;
    };

    let result = match task.kind {
        TaskKind::InboundCall => {
            let sdp = task.payload.get("sdp").and_then(|v| v.as_str()).unwrap_or("");
            setup::run_inbound_setup(&app, &session, sdp).await
        }
        TaskKind::WebCall => {
            let sdp = task.payload.get("sdp").and_then(|v| v.as_str()).unwrap_or("");
            setup::run_inbound_setup(&app, &session, sdp).await
        }
        TaskKind::OutboundCall => outbound::run_outbound_setup(&app, &session).await,
        TaskKind::LivekitRoom => {
            let room = task
                .payload
                .get("roomName")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_owned();
            livekit::run_room_setup(&app, &session, &room).await
        }
    };

    if let Err(e) = result {
        tracing::error!(
            task = task.kind.as_str(),
            connection_id = %task.connection_id,
            error = %e,
            "session setup failed"
        );
        app.sessions
            .notify_cleanup(&task.connection_id, "setup failure")
            .await;
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_call_request_parses_spec_payload() {
        let request: NewCallRequest = serde_json::from_str(
            r#"{"callId":"C1","tenantId":"T1","sdp":"v=0...","agentId":"A1",
                "businessNumber":"15550001111","from":"15551234567","language":"es"}"#,
        )
        .unwrap();
        assert_eq!(request.call_id, "C1");
        assert_eq!(request.tenant_id.as_deref(), Some("T1"));
        assert_eq!(request.agent_id, "A1");
        assert_eq!(request.language.as_deref(), Some("es"));
        assert!(request.model_provider.is_none());
    }

    #[test]
    fn new_call_response_shape() {
        let response = NewCallResponse {
            code: 200,
            message: "Call accepted successfully".into(),
            connection_id: "wati_C1_ab12cd34".into(),
            call_id: "C1".into(),
            sdp_answer: "v=0...".into(),
            relay_mode: true,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["code"], 200);
        assert_eq!(json["connectionId"], "wati_C1_ab12cd34");
        assert_eq!(json["sdpAnswer"], "v=0...");
        assert_eq!(json["relayMode"], true);
    }

    #[test]
    fn outbound_initiate_parses_spec_payload() {
        let request: OutboundInitiateRequest = serde_json::from_str(
            r#"{"waid":"15551234567","tenantId":"T1","agentId":"A1"}"#,
        )
        .unwrap();
        assert_eq!(request.waid, "15551234567");
        assert_eq!(request.agent_id.as_deref(), Some("A1"));
        assert!(request.channel_phone_number.is_none());
    }

    #[test]
    fn call_status_webhook_parses() {
        let webhook: CallStatusWebhook =
            serde_json::from_str(r#"{"callId":"C1","status":"ACCEPTED"}"#).unwrap();
        assert_eq!(webhook.status, "ACCEPTED");
    }

    #[test]
    fn connection_id_format() {
        let id = connection_id_for("wati", "C1");
        assert!(id.starts_with("wati_C1_"));
        let suffix = id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
