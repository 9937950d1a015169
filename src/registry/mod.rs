//! Cross-pod session registry and cleanup broadcast.
//!
//! The registry is the only state shared between pods. Each session is
//! registered under a TTL key by the pod that owns its media sockets; other
//! pods may only ask for termination through the cleanup channel. Cleanup is
//! at-least-once and idempotent: any pod may publish, every pod reacts, and
//! re-delivery is safe because a session closes exactly once.

pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::config::STORE_OP_DEADLINE;

/// TTL on a session-info key. Refreshed on every register.
pub const SESSION_TTL: Duration = Duration::from_secs(3600);

/// Channel carrying cleanup broadcasts.
pub const CLEANUP_CHANNEL: &str = "astra:voice:session:cleanup";

const SESSION_KEY_PREFIX: &str = "astra:voice:session:info:";

/// Registry key for a session id.
pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}

/// What a pod publishes about a session it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub pod_id: String,
    pub agent_id: String,
    pub start_time: DateTime<Utc>,
    pub channel_type: String,
}

/// Payload of a cleanup broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupNotice {
    pub session_id: String,
}

/// Handler invoked for every cleanup broadcast received on this pod.
pub type CleanupHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

// ── Registry ───────────────────────────────────────────────────────

pub struct SessionRegistry {
    manager: ConnectionManager,
    pod_id: String,
}

impl SessionRegistry {
    pub fn new(manager: ConnectionManager, pod_id: String) -> Self {
        Self { manager, pod_id }
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    /// Register (or re-register) a session, resetting its TTL.
    pub async fn register(&self, info: &SessionInfo) -> anyhow::Result<()> {
        let key = session_key(&info.session_id);
        let payload = serde_json::to_string(info)?;
        let mut conn = self.manager.clone();
        tokio::time::timeout(
            STORE_OP_DEADLINE,
            conn.set_ex::<_, _, ()>(key, payload, SESSION_TTL.as_secs()),
        )
        .await
        .map_err(|_| anyhow::anyhow!("session register timed out"))??;
        Ok(())
    }

    pub async fn unregister(&self, session_id: &str) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        tokio::time::timeout(STORE_OP_DEADLINE, conn.del::<_, ()>(session_key(session_id)))
            .await
            .map_err(|_| anyhow::anyhow!("session unregister timed out"))??;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> anyhow::Result<Option<SessionInfo>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = tokio::time::timeout(
            STORE_OP_DEADLINE,
            conn.get(session_key(session_id)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("session lookup timed out"))??;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

// ── Cleanup bus ────────────────────────────────────────────────────

pub struct CleanupBus {
    client: redis::Client,
    manager: ConnectionManager,
}

impl CleanupBus {
    pub fn new(client: redis::Client, manager: ConnectionManager) -> Self {
        Self { client, manager }
    }

    /// Broadcast a cleanup request to every pod. The caller is expected to
    /// have already run its local cleanup path — local-first keeps
    /// termination working even when the bus is down.
    pub async fn publish(&self, session_id: &str) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&CleanupNotice {
            session_id: session_id.to_owned(),
        })?;
        let mut conn = self.manager.clone();
        tokio::time::timeout(
            STORE_OP_DEADLINE,
            conn.publish::<_, _, ()>(CLEANUP_CHANNEL, payload),
        )
        .await
        .map_err(|_| anyhow::anyhow!("cleanup publish timed out"))??;
        Ok(())
    }

    /// Subscribe to cleanup broadcasts. The handler receives the session id
    /// of every notice, including this pod's own publications (re-running
    /// local cleanup is a no-op).
    pub fn spawn_subscriber(&self, handler: CleanupHandler) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(CLEANUP_CHANNEL).await {
                            tracing::error!(error = %e, "cleanup channel subscribe failed");
                        } else {
                            tracing::info!(channel = CLEANUP_CHANNEL, "cleanup subscriber online");
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "unreadable cleanup notice");
                                        continue;
                                    }
                                };
                                match serde_json::from_str::<CleanupNotice>(&payload) {
                                    Ok(notice) => handler(notice.session_id).await,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "malformed cleanup notice")
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "cleanup subscriber connect failed");
                    }
                }
                // Connection lost; back off briefly and resubscribe.
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_store_contract() {
        assert_eq!(
            session_key("wati_C1_ab12cd34"),
            "astra:voice:session:info:wati_C1_ab12cd34"
        );
        assert_eq!(CLEANUP_CHANNEL, "astra:voice:session:cleanup");
        assert_eq!(SESSION_TTL.as_secs(), 3600);
    }

    #[test]
    fn session_info_roundtrip() {
        let info = SessionInfo {
            session_id: "s1".into(),
            pod_id: "pod-a".into(),
            agent_id: "A1".into(),
            start_time: Utc::now(),
            channel_type: "whatsapp".into(),
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: SessionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn cleanup_notice_shape() {
        let json = serde_json::to_string(&CleanupNotice {
            session_id: "s1".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"session_id":"s1"}"#);
    }
}
