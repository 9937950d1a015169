//! Usage and conversation-metrics emission.
//!
//! At session cleanup — and only for sessions that were ever connected and
//! belong to a real tenant — two events go to the external bus: a voice
//! usage event for billing and a conversation metrics event for analytics.
//! Emission is fire-and-forget with a deadline; failures are logged, never
//! propagated into the cleanup path.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{PubSubConfig, METRICS_DEADLINE};

/// Billing event: seconds of voice connectivity for one call.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceUsageEvent {
    pub tenant_id: String,
    pub agent_id: String,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageTiming {
    pub id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

/// Analytics event describing the whole conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMetricsEvent {
    pub conversation_id: String,
    pub tenant_id: String,
    /// Textual agent id when the agent has one, else the primary id.
    pub agent_id: String,
    pub channel: String,
    /// Comma-joined languages heard on the call.
    pub language: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration: u64,
    pub turn_count: u32,
    pub messages: Vec<MessageTiming>,
    pub actions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

enum Backend {
    Disabled,
    PubSub {
        client: reqwest::Client,
        base_url: String,
        project_id: String,
        topic_name: String,
        pub_id: String,
    },
}

pub struct UsagePublisher {
    backend: Backend,
}

impl UsagePublisher {
    pub fn new(config: Option<&PubSubConfig>) -> Self {
        let backend = match config {
            Some(config) => Backend::PubSub {
                client: reqwest::Client::new(),
                base_url: "https://pubsub.googleapis.com".to_owned(),
                project_id: config.project_id.clone(),
                topic_name: config.topic_name.clone(),
                pub_id: config.pub_id.clone(),
            },
            None => Backend::Disabled,
        };
        Self { backend }
    }

    pub fn disabled() -> Self {
        Self {
            backend: Backend::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.backend, Backend::Disabled)
    }

    pub async fn publish_voice_usage(&self, event: &VoiceUsageEvent) {
        self.publish("voice_usage", event).await;
    }

    pub async fn publish_conversation_metrics(&self, event: &ConversationMetricsEvent) {
        self.publish("conversation_metrics", event).await;
    }

    async fn publish<T: Serialize>(&self, kind: &str, event: &T) {
        let Backend::PubSub {
            client,
            base_url,
            project_id,
            topic_name,
            pub_id,
        } = &self.backend
        else {
            return;
        };

        let body = match build_publish_body(kind, pub_id, event) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(kind, error = %e, "usage event serialization failed");
                return;
            }
        };
        let url = format!("{base_url}/v1/projects/{project_id}/topics/{topic_name}:publish");

        let mut request = client.post(&url).json(&body).timeout(METRICS_DEADLINE);
        if let Ok(token) = std::env::var("PUBSUB_TOKEN") {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(kind, "usage event published");
            }
            Ok(response) => {
                tracing::warn!(kind, status = %response.status(), "usage event rejected");
            }
            Err(e) => {
                tracing::warn!(kind, error = %e, "usage event publish failed");
            }
        }
    }
}

/// Pub/Sub publish body: base64 data plus routing attributes.
fn build_publish_body<T: Serialize>(
    kind: &str,
    pub_id: &str,
    event: &T,
) -> anyhow::Result<serde_json::Value> {
    let data = serde_json::to_vec(event)?;
    Ok(serde_json::json!({
        "messages": [{
            "data": base64::engine::general_purpose::STANDARD.encode(data),
            "attributes": {
                "event_type": kind,
                "publisher": pub_id,
            }
        }]
    }))
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_usage_event_shape() {
        let event = VoiceUsageEvent {
            tenant_id: "T1".into(),
            agent_id: "A1".into(),
            duration_seconds: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tenant_id"], "T1");
        assert_eq!(json["duration_seconds"], 42);
    }

    #[test]
    fn metrics_event_shape() {
        let now = Utc::now();
        let event = ConversationMetricsEvent {
            conversation_id: "c1".into(),
            tenant_id: "T1".into(),
            agent_id: "text-a1".into(),
            channel: "voice".into(),
            language: "en,es".into(),
            start_at: now,
            end_at: now,
            duration: 30,
            turn_count: 4,
            messages: vec![MessageTiming {
                id: "m1".into(),
                start_at: now,
                end_at: now,
            }],
            actions: vec!["book_slot".into()],
            created_at: now,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["channel"], "voice");
        assert_eq!(json["language"], "en,es");
        assert_eq!(json["messages"][0]["id"], "m1");
        assert_eq!(json["turn_count"], 4);
    }

    #[test]
    fn publish_body_wraps_base64_data() {
        let event = VoiceUsageEvent {
            tenant_id: "T1".into(),
            agent_id: "A1".into(),
            duration_seconds: 5,
        };
        let body = build_publish_body("voice_usage", "astra-voice", &event).unwrap();
        assert_eq!(body["messages"][0]["attributes"]["event_type"], "voice_usage");
        let data = body["messages"][0]["data"].as_str().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(data).unwrap();
        let back: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(back["tenant_id"], "T1");
    }

    #[tokio::test]
    async fn disabled_publisher_is_a_noop() {
        let publisher = UsagePublisher::disabled();
        assert!(!publisher.is_enabled());
        publisher
            .publish_voice_usage(&VoiceUsageEvent {
                tenant_id: "T1".into(),
                agent_id: "A1".into(),
                duration_seconds: 1,
            })
            .await;
    }
}
