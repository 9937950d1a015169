//! Asynchronous task bus for session setup work.
//!
//! Channel adapters answer HTTP quickly and push the heavy part of call
//! setup (SDP answering, provider-session opening) onto this bus. Messages
//! fan out to every pod; each pod checks its local session table and
//! silently drops tasks for sessions it does not own — the owning pod
//! receives the same message and acts on it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::config::STORE_OP_DEADLINE;

/// Channel carrying task messages.
pub const TASK_CHANNEL: &str = "astra:voice:session:tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    InboundCall,
    WebCall,
    OutboundCall,
    LivekitRoom,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InboundCall => "inbound_call",
            Self::WebCall => "web_call",
            Self::OutboundCall => "outbound_call",
            Self::LivekitRoom => "livekit_room",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub connection_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Handler invoked for every task message received on this pod.
pub type TaskHandler = Arc<dyn Fn(TaskMessage) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct TaskBus {
    client: redis::Client,
    manager: ConnectionManager,
}

impl TaskBus {
    pub fn new(client: redis::Client, manager: ConnectionManager) -> Self {
        Self { client, manager }
    }

    pub async fn publish(&self, task: &TaskMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.manager.clone();
        tokio::time::timeout(
            STORE_OP_DEADLINE,
            conn.publish::<_, _, ()>(TASK_CHANNEL, payload),
        )
        .await
        .map_err(|_| anyhow::anyhow!("task publish timed out"))??;
        tracing::debug!(
            task = task.kind.as_str(),
            connection_id = %task.connection_id,
            "task published"
        );
        Ok(())
    }

    pub fn spawn_subscriber(&self, handler: TaskHandler) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(TASK_CHANNEL).await {
                            tracing::error!(error = %e, "task channel subscribe failed");
                        } else {
                            tracing::info!(channel = TASK_CHANNEL, "task subscriber online");
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "unreadable task message");
                                        continue;
                                    }
                                };
                                match serde_json::from_str::<TaskMessage>(&payload) {
                                    Ok(task) => handler(task).await,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "malformed task message")
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "task subscriber connect failed");
                    }
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_snake_case() {
        assert_eq!(TaskKind::InboundCall.as_str(), "inbound_call");
        assert_eq!(TaskKind::WebCall.as_str(), "web_call");
        assert_eq!(TaskKind::OutboundCall.as_str(), "outbound_call");
        assert_eq!(TaskKind::LivekitRoom.as_str(), "livekit_room");
    }

    #[test]
    fn message_wire_shape() {
        let task = TaskMessage {
            kind: TaskKind::InboundCall,
            connection_id: "wati_C1_ab12cd34".into(),
            payload: serde_json::json!({"sdp": "v=0..."}),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "inbound_call");
        assert_eq!(json["connection_id"], "wati_C1_ab12cd34");
        assert_eq!(json["payload"]["sdp"], "v=0...");

        let back: TaskMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, TaskKind::InboundCall);
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let back: TaskMessage = serde_json::from_str(
            r#"{"type":"web_call","connection_id":"web_C2_aa"}"#,
        )
        .unwrap();
        assert_eq!(back.kind, TaskKind::WebCall);
        assert!(back.payload.is_null());
    }
}
