//! WATI call-provider client and WhatsApp inbound-call adapter.
//!
//! The provider fronts WhatsApp calling: it relays SDP between the phone
//! and this gateway, answers permission queries for outbound calls, and
//! posts status webhooks back to us.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::app::VoiceApp;
use crate::config::WatiConfig;
use crate::error::GatewayError;
use crate::events::{Event, EventData, EventType};
use crate::model::ModelProvider;
use crate::registry::tasks::{TaskKind, TaskMessage};
use crate::session::{CallDirection, ChannelType, SessionParams};

use super::{connection_id_for, NewCallRequest, NewCallResponse};

/// How long a new-call request waits for the owning pod to produce the
/// answer before giving up.
const ANSWER_DEADLINE: Duration = Duration::from_secs(15);

const PROVIDER_DEADLINE: Duration = Duration::from_secs(10);

// ── Provider client ────────────────────────────────────────────────

#[derive(Clone)]
pub struct WatiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

/// What the provider allows us to do toward one WhatsApp user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionDecision {
    pub can_start_call: bool,
    pub can_request_permission: bool,
}

impl WatiClient {
    pub fn new(config: &WatiConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}{path}", self.base_url))
            .timeout(PROVIDER_DEADLINE);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        builder
    }

    /// Signal the phone that the call will be picked up.
    pub async fn pre_accept_call(&self, call_id: &str) -> anyhow::Result<()> {
        self.request(&format!("/api/v1/calls/{call_id}/pre-accept"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Accept the call, handing our SDP answer to the provider.
    pub async fn accept_call(&self, call_id: &str, sdp_answer: &str) -> anyhow::Result<()> {
        self.request(&format!("/api/v1/calls/{call_id}/accept"))
            .json(&serde_json::json!({"sdp": sdp_answer}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn reject_call(&self, call_id: &str) -> anyhow::Result<()> {
        self.request(&format!("/api/v1/calls/{call_id}/reject"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn terminate_call(&self, call_id: &str) -> anyhow::Result<()> {
        self.request(&format!("/api/v1/calls/{call_id}/terminate"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Ask what we may do toward this user right now.
    pub async fn check_call_permissions(&self, waid: &str) -> anyhow::Result<PermissionDecision> {
        let response = self
            .request("/api/v1/calls/permissions")
            .json(&serde_json::json!({"waid": waid}))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        Ok(parse_permissions(&body))
    }

    pub async fn send_call_permission_request(&self, waid: &str) -> anyhow::Result<()> {
        self.request("/api/v1/calls/permission-request")
            .json(&serde_json::json!({"waid": waid}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Start an outbound call with our SDP offer. The answer and status
    /// updates arrive as webhooks.
    pub async fn initiate_call(
        &self,
        call_id: &str,
        waid: &str,
        channel_phone_number: Option<&str>,
        sdp_offer: &str,
    ) -> anyhow::Result<()> {
        self.request("/api/v1/calls/initiate")
            .json(&serde_json::json!({
                "callId": call_id,
                "waid": waid,
                "channelPhoneNumber": channel_phone_number,
                "sdp": sdp_offer,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Parse the provider's permission shape:
/// `result.actions[*].{action_name, can_perform_action}`. The shape is not
/// contractually documented — anything missing means deny-all.
pub fn parse_permissions(body: &serde_json::Value) -> PermissionDecision {
    let mut decision = PermissionDecision::default();
    let Some(actions) = body.pointer("/result/actions").and_then(|v| v.as_array()) else {
        return decision;
    };
    for action in actions {
        let name = action.get("action_name").and_then(|v| v.as_str()).unwrap_or("");
        let allowed = action
            .get("can_perform_action")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        match name {
            "start_call" => decision.can_start_call = allowed,
            "send_call_permission_request" => decision.can_request_permission = allowed,
            _ => {}
        }
    }
    decision
}

// ── Inbound adapter ────────────────────────────────────────────────

/// Create and register the session for one inbound call, queue its setup,
/// and wait for the generated answer.
pub async fn handle_new_call(
    app: &Arc<VoiceApp>,
    request: NewCallRequest,
    channel_type: ChannelType,
) -> Result<NewCallResponse, GatewayError> {
    if request.call_id.trim().is_empty() {
        return Err(GatewayError::Validation("callId is required".into()));
    }
    if request.sdp.trim().is_empty() {
        return Err(GatewayError::Validation("sdp offer is required".into()));
    }
    if request.agent_id.trim().is_empty() {
        return Err(GatewayError::Validation("agentId is required".into()));
    }

    let agent = app
        .agent_cache
        .get(&request.agent_id)
        .ok_or_else(|| GatewayError::NotFound(format!("unknown agent: {}", request.agent_id)))?;
    let model_provider = match &request.model_provider {
        Some(tag) => ModelProvider::from_str_tag(tag)
            .ok_or_else(|| GatewayError::Validation(format!("unknown model provider: {tag}")))?,
        None => ModelProvider::OpenAi,
    };

    let prefix = match channel_type {
        ChannelType::Whatsapp => "wati",
        ChannelType::Web => "web",
        ChannelType::Test => "test",
        _ => "call",
    };
    let connection_id = connection_id_for(prefix, &request.call_id);
    let tenant_id = request
        .tenant_id
        .clone()
        .unwrap_or_else(|| agent.tenant_id.clone());

    let session = app
        .sessions
        .create_session(SessionParams {
            id: connection_id.clone(),
            call_id: request.call_id.clone(),
            channel_type,
            direction: CallDirection::Inbound,
            from: request.from.clone().unwrap_or_default(),
            to: request.business_number.clone().unwrap_or_default(),
            tenant_id,
            agent_id: agent.id.clone(),
            text_agent_id: agent.text_agent_id.clone(),
            voice_language: request
                .language
                .clone()
                .unwrap_or_else(|| agent.language.clone()),
            accent: request.accent.clone().unwrap_or_default(),
            model_provider,
        })
        .await
        .map_err(GatewayError::Internal)?;

    if channel_type == ChannelType::Whatsapp {
        app.event_bus.publish(
            Event::new(EventType::WhatsAppCallStarted, &connection_id).with_data(
                EventData::CallInfo {
                    call_id: request.call_id.clone(),
                    from: session.from.clone(),
                    to: session.to.clone(),
                },
            ),
        );
    }

    if let Err(e) = app.sessions.initialize_conversation(&session).await {
        tracing::warn!(session_id = %connection_id, error = %e, "conversation init failed");
    }

    let kind = if channel_type == ChannelType::Whatsapp {
        TaskKind::InboundCall
    } else {
        TaskKind::WebCall
    };
    // Watch for the answer before queueing the task so a fast setup on
    // this pod cannot slip past the wait.
    let (watch_handle, answer_rx) = app
        .event_bus
        .watch_for(EventType::SdpAnswerGenerated, &connection_id);
    if let Err(e) = app
        .task_bus
        .publish(&TaskMessage {
            kind,
            connection_id: connection_id.clone(),
            payload: serde_json::json!({"sdp": request.sdp}),
        })
        .await
    {
        app.event_bus.unsubscribe(watch_handle);
        return Err(GatewayError::Internal(e));
    }

    // The owning pod (normally this one) answers through the event bus.
    let answer = tokio::time::timeout(ANSWER_DEADLINE, answer_rx).await;
    app.event_bus.unsubscribe(watch_handle);
    let answer_event = match answer {
        Ok(Ok(event)) => event,
        _ => {
            app.sessions.notify_cleanup(&connection_id, "answer timeout").await;
            return Err(GatewayError::Timeout(
                "no SDP answer produced for the call".into(),
            ));
        }
    };
    let sdp_answer = match answer_event.data {
        Some(EventData::Sdp { sdp }) => sdp,
        _ => String::new(),
    };

    Ok(NewCallResponse {
        code: 200,
        message: "Call accepted successfully".into(),
        connection_id,
        call_id: request.call_id,
        sdp_answer,
        relay_mode: true,
    })
}

/// Terminate by connection id or call id. Missing sessions are fine —
/// termination is best-effort by contract.
pub async fn handle_terminate(
    app: &Arc<VoiceApp>,
    connection_id: Option<&str>,
    call_id: Option<&str>,
) {
    let session = connection_id
        .and_then(|id| app.sessions.get(id))
        .or_else(|| call_id.and_then(|id| app.sessions.find_by_call_id(id)));
    match session {
        Some(session) => {
            app.sessions
                .notify_cleanup(&session.id, "terminate requested")
                .await;
        }
        None => {
            // Another pod may own it; the broadcast reaches them all.
            if let Some(id) = connection_id {
                app.sessions.notify_cleanup(id, "terminate requested").await;
            }
        }
    }
}

// ── Management webhook ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderWebhook {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub call_id: Option<String>,
}

/// Act on provider lifecycle notifications.
pub async fn handle_provider_webhook(app: &Arc<VoiceApp>, webhook: ProviderWebhook) {
    let Some(call_id) = webhook.call_id.as_deref() else {
        tracing::debug!(event = %webhook.event, "provider webhook without call id");
        return;
    };
    let Some(session) = app.sessions.find_by_call_id(call_id) else {
        tracing::debug!(event = %webhook.event, call_id, "provider webhook for unknown call");
        return;
    };

    match webhook.event.as_str() {
        "call_accepted" | "call_connected" => {
            app.event_bus
                .publish(Event::new(EventType::WhatsAppCallAccepted, &session.id));
        }
        "call_ended" | "call_terminated" => {
            app.sessions
                .notify_cleanup(&session.id, "provider reported call end")
                .await;
        }
        other => {
            tracing::debug!(event = other, call_id, "unhandled provider webhook");
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_parse_spec_shape() {
        let body = serde_json::json!({
            "result": {
                "actions": [
                    {"action_name": "start_call", "can_perform_action": false},
                    {"action_name": "send_call_permission_request", "can_perform_action": true}
                ]
            }
        });
        let decision = parse_permissions(&body);
        assert!(!decision.can_start_call);
        assert!(decision.can_request_permission);
    }

    #[test]
    fn permissions_missing_result_denies_all() {
        assert_eq!(parse_permissions(&serde_json::json!({})), PermissionDecision::default());
        assert_eq!(
            parse_permissions(&serde_json::json!({"result": {}})),
            PermissionDecision::default()
        );
        assert_eq!(
            parse_permissions(&serde_json::json!({"result": {"actions": "nope"}})),
            PermissionDecision::default()
        );
    }

    #[test]
    fn permissions_unknown_actions_ignored() {
        let body = serde_json::json!({
            "result": {
                "actions": [
                    {"action_name": "send_video", "can_perform_action": true},
                    {"action_name": "start_call", "can_perform_action": true}
                ]
            }
        });
        let decision = parse_permissions(&body);
        assert!(decision.can_start_call);
        assert!(!decision.can_request_permission);
    }

    #[test]
    fn permissions_missing_flag_is_deny() {
        let body = serde_json::json!({
            "result": {"actions": [{"action_name": "start_call"}]}
        });
        assert!(!parse_permissions(&body).can_start_call);
    }

    #[test]
    fn provider_webhook_parses() {
        let webhook: ProviderWebhook =
            serde_json::from_str(r#"{"event":"call_ended","callId":"C1"}"#).unwrap();
        assert_eq!(webhook.event, "call_ended");
        assert_eq!(webhook.call_id.as_deref(), Some("C1"));
    }
}
