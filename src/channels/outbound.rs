//! Outbound WhatsApp calling.
//!
//! The most involved adapter: resolve what the provider lets us do toward
//! the callee, then either start calling immediately or ask for permission
//! and park the session until the permission webhook resumes it. Media is
//! offer-first (we generate, the callee answers via webhook), and the
//! greeting waits for the model to be ready after the callee accepts.

use std::sync::Arc;
use std::time::Duration;

use crate::app::{PendingPermission, VoiceApp};
use crate::config::OUTBOUND_READY_DEADLINE;
use crate::error::GatewayError;
use crate::events::{Event, EventType};
use crate::model::ModelProvider;
use crate::registry::tasks::{TaskKind, TaskMessage};
use crate::session::{
    CallDirection, CallSession, ChannelType, OutboundCallState, SessionParams,
};

use super::setup;
use super::{connection_id_for, OutboundInitiateRequest, OutboundInitiateResponse};

/// Tick of the model-readiness poll after the callee accepts.
const READY_POLL_TICK: Duration = Duration::from_millis(100);

/// Start an outbound call. `prod` skips the permission handshake (numbers
/// with standing call consent).
pub async fn handle_initiate(
    app: &Arc<VoiceApp>,
    request: OutboundInitiateRequest,
    prod: bool,
) -> Result<OutboundInitiateResponse, GatewayError> {
    if request.waid.trim().is_empty() {
        return Err(GatewayError::Validation("waid is required".into()));
    }
    let agent_id = request
        .agent_id
        .clone()
        .ok_or_else(|| GatewayError::Validation("agentId is required".into()))?;
    let agent = app
        .agent_cache
        .get(&agent_id)
        .ok_or_else(|| GatewayError::NotFound(format!("unknown agent: {agent_id}")))?;

    let decision = if prod {
        crate::channels::wati::PermissionDecision {
            can_start_call: true,
            can_request_permission: false,
        }
    } else {
        app.wati
            .check_call_permissions(&request.waid)
            .await
            .map_err(|e| GatewayError::Dependency(format!("permission check failed: {e}")))?
    };

    if !decision.can_start_call && !decision.can_request_permission {
        return Err(GatewayError::Forbidden(
            "calling this user is not permitted".into(),
        ));
    }

    let call_id = uuid::Uuid::new_v4().to_string();
    let connection_id = connection_id_for("out", &call_id);
    let tenant_id = request
        .tenant_id
        .clone()
        .unwrap_or_else(|| agent.tenant_id.clone());

    let session = app
        .sessions
        .create_session(SessionParams {
            id: connection_id.clone(),
            call_id: call_id.clone(),
            channel_type: ChannelType::Outbound,
            direction: CallDirection::Outbound,
            from: request.channel_phone_number.clone().unwrap_or_default(),
            to: request.waid.clone(),
            tenant_id,
            agent_id: agent.id.clone(),
            text_agent_id: agent.text_agent_id.clone(),
            voice_language: request
                .voice_language
                .clone()
                .unwrap_or_else(|| agent.language.clone()),
            accent: request.accent.clone().unwrap_or_default(),
            model_provider: ModelProvider::OpenAi,
        })
        .await
        .map_err(GatewayError::Internal)?;

    if let Err(e) = app.sessions.initialize_conversation(&session).await {
        tracing::warn!(session_id = %connection_id, error = %e, "conversation init failed");
    }

    if decision.can_start_call {
        app.task_bus
            .publish(&TaskMessage {
                kind: TaskKind::OutboundCall,
                connection_id: connection_id.clone(),
                payload: serde_json::json!({"waid": request.waid}),
            })
            .await
            .map_err(GatewayError::Internal)?;
        return Ok(OutboundInitiateResponse {
            call_id,
            connection_id,
            status: "calling",
        });
    }

    // Permission-request path: park the session until the webhook resumes.
    session
        .set_outbound_state(OutboundCallState::WaitingPermission)
        .await
        .map_err(GatewayError::Internal)?;
    app.wati
        .send_call_permission_request(&request.waid)
        .await
        .map_err(|e| GatewayError::Dependency(format!("permission request failed: {e}")))?;
    app.pending_permissions.lock().insert(
        request.waid.clone(),
        PendingPermission {
            connection_id: connection_id.clone(),
            waid: request.waid.clone(),
        },
    );
    Ok(OutboundInitiateResponse {
        call_id,
        connection_id,
        status: "waiting_permission",
    })
}

/// Owning-pod setup for an outbound call: generate the offer, hand it to
/// the provider, open the provider session with the greeting withheld.
pub async fn run_outbound_setup(
    app: &Arc<VoiceApp>,
    session: &Arc<CallSession>,
) -> anyhow::Result<()> {
    let agent = app
        .agent_cache
        .get(&session.agent_id)
        .ok_or_else(|| anyhow::anyhow!("agent disappeared from cache: {}", session.agent_id))?;

    let hooks = setup::build_inbound_hooks(app, session);
    let (offer, track_writer) = app.webrtc.generate_sdp_offer(&session.id, hooks).await?;
    {
        let mut state = session.state.lock().await;
        state.track_writer = Some(Arc::clone(&track_writer));
    }
    session
        .output
        .set_target(crate::model::OutputTarget::Opus(track_writer));

    let channel_phone = (!session.from.is_empty()).then_some(session.from.as_str());
    app.wati
        .initiate_call(&session.call_id, &session.to, channel_phone, &offer)
        .await?;
    tracing::info!(
        session_id = %session.id,
        call_id = %session.call_id,
        waid = %session.to,
        "outbound call initiated"
    );

    let model = setup::connect_model(app, session, &agent).await?;
    // The callee is not there yet: the greeting waits for ACCEPTED.
    model.enable_greeting_signal_control();
    Ok(())
}

// ── Webhooks ───────────────────────────────────────────────────────

/// `POST /wati/outbound/permission` — the callee granted or denied.
pub async fn handle_permission_webhook(
    app: &Arc<VoiceApp>,
    waid: &str,
    has_permission: bool,
) -> Result<serde_json::Value, GatewayError> {
    let pending = app.pending_permissions.lock().remove(waid);
    let Some(pending) = pending else {
        // Unknown or already-resumed: termination paths are forgiving.
        return Ok(serde_json::json!({"code": 200, "message": "no call waiting on permission"}));
    };
    let Some(session) = app.sessions.get(&pending.connection_id) else {
        return Ok(serde_json::json!({"code": 200, "message": "session already gone"}));
    };

    if !has_permission {
        app.sessions
            .notify_cleanup(&session.id, "call permission denied")
            .await;
        return Ok(serde_json::json!({"code": 200, "message": "permission denied; call abandoned"}));
    }

    session
        .set_outbound_state(OutboundCallState::Calling)
        .await
        .map_err(GatewayError::Internal)?;
    app.task_bus
        .publish(&TaskMessage {
            kind: TaskKind::OutboundCall,
            connection_id: session.id.clone(),
            payload: serde_json::json!({"waid": waid}),
        })
        .await
        .map_err(GatewayError::Internal)?;
    Ok(serde_json::json!({"code": 200, "message": "calling", "connectionId": session.id}))
}

/// `POST /wati/outbound/sdp-answer` — the callee's SDP arrived.
pub async fn handle_sdp_answer_webhook(
    app: &Arc<VoiceApp>,
    call_id: &str,
    sdp: &str,
) -> Result<(), GatewayError> {
    let Some(session) = app.sessions.find_by_call_id(call_id) else {
        return Err(GatewayError::NotFound(format!("unknown call: {call_id}")));
    };
    app.webrtc
        .process_sdp_answer(&session.id, sdp)
        .await
        .map_err(|e| {
            GatewayError::Dependency(format!("SDP answer rejected: {e}"))
        })?;
    Ok(())
}

/// `POST /wati/outbound/call-status` — RINGING / ACCEPTED / REJECTED /
/// ENDED transitions.
pub async fn handle_call_status_webhook(
    app: &Arc<VoiceApp>,
    call_id: &str,
    status: &str,
) -> Result<(), GatewayError> {
    let Some(session) = app.sessions.find_by_call_id(call_id) else {
        // Status for a finished call: fine.
        return Ok(());
    };

    match status {
        "RINGING" => {
            session
                .set_outbound_state(OutboundCallState::Ringing)
                .await
                .map_err(GatewayError::Internal)?;
        }
        "ACCEPTED" => {
            session
                .set_outbound_state(OutboundCallState::Accepted)
                .await
                .map_err(GatewayError::Internal)?;
            session.mark_connected();
            app.event_bus
                .publish(Event::new(EventType::WhatsAppCallAccepted, &session.id));
            spawn_readiness_poll(app, &session);
        }
        "REJECTED" => {
            let _ = session.set_outbound_state(OutboundCallState::Rejected).await;
            app.sessions
                .notify_cleanup(&session.id, "callee rejected")
                .await;
        }
        "ENDED" => {
            let _ = session.set_outbound_state(OutboundCallState::Ended).await;
            app.sessions
                .notify_cleanup(&session.id, "callee hung up")
                .await;
        }
        other => {
            return Err(GatewayError::Validation(format!(
                "unknown call status: {other}"
            )));
        }
    }
    Ok(())
}

/// After ACCEPTED: poll for model readiness on a tight tick, release the
/// greeting when it is up, and abandon the call when it never comes.
fn spawn_readiness_poll(app: &Arc<VoiceApp>, session: &Arc<CallSession>) {
    let app = Arc::clone(app);
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + OUTBOUND_READY_DEADLINE;
        loop {
            if session.is_closed() {
                return;
            }
            if session.is_model_ready() {
                if let Some(model) = session.model() {
                    setup::trigger_greeting(&session, &model).await;
                }
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    session_id = %session.id,
                    "model not ready within the readiness deadline; abandoning call"
                );
                app.sessions
                    .notify_cleanup(&session.id, "outbound readiness timeout")
                    .await;
                return;
            }
            tokio::time::sleep(READY_POLL_TICK).await;
        }
    });
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_poll_constants_match_contract() {
        assert_eq!(READY_POLL_TICK, Duration::from_millis(100));
        assert_eq!(OUTBOUND_READY_DEADLINE, Duration::from_secs(30));
    }

    #[test]
    fn initiate_response_statuses() {
        let calling = OutboundInitiateResponse {
            call_id: "c".into(),
            connection_id: "out_c_aabbccdd".into(),
            status: "calling",
        };
        let json = serde_json::to_value(&calling).unwrap();
        assert_eq!(json["status"], "calling");

        let waiting = OutboundInitiateResponse {
            call_id: "c".into(),
            connection_id: "out_c_aabbccdd".into(),
            status: "waiting_permission",
        };
        let json = serde_json::to_value(&waiting).unwrap();
        assert_eq!(json["status"], "waiting_permission");
    }
}
