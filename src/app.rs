//! Runtime assembly.
//!
//! Everything long-lived hangs off [`VoiceApp`]: buses, caches, the session
//! manager, provider clients. Built once in `main`, shared as an `Arc` by
//! the gateway handlers, channel adapters and background loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::agents::AgentCache;
use crate::channels::wati::WatiClient;
use crate::config::Config;
use crate::events::middleware::{
    DeduplicationMiddleware, LoggingMiddleware, MetricsMiddleware, RateLimitMiddleware,
    RecoveryMiddleware, TimeoutMiddleware, ValidationMiddleware,
};
use crate::events::EventBus;
use crate::recording::{AudioStorage, Recorder};
use crate::registry::tasks::TaskBus;
use crate::registry::{CleanupBus, SessionRegistry};
use crate::session::SessionManager;
use crate::store::{ConversationStore, InMemoryConversationStore};
use crate::usage::UsagePublisher;
use crate::webrtc::{IceProvider, WebRtcProcessor};

/// A session waiting for a call-permission webhook, keyed by WhatsApp id.
#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub connection_id: String,
    pub waid: String,
}

pub struct VoiceApp {
    pub config: Config,
    pub event_bus: Arc<EventBus>,
    pub agent_cache: Arc<AgentCache>,
    pub sessions: Arc<SessionManager>,
    pub webrtc: Arc<WebRtcProcessor>,
    pub ice: Arc<IceProvider>,
    pub wati: WatiClient,
    pub task_bus: Arc<TaskBus>,
    pub cleanup_bus: Arc<CleanupBus>,
    pub recorder: Arc<Recorder>,
    pub store: Arc<dyn ConversationStore>,
    pub usage: Arc<UsagePublisher>,
    pub started_at: Instant,
    /// Outbound sessions waiting on a permission webhook, by waid.
    pub pending_permissions: Mutex<HashMap<String, PendingPermission>>,
    /// LiveKit room name → call record, for webhook routing and egress.
    pub livekit_rooms: Mutex<HashMap<String, Arc<crate::channels::livekit::LiveKitCall>>>,
}

impl VoiceApp {
    /// Wire the full runtime. Connects to Redis; fails fast when the shared
    /// store is unreachable.
    pub async fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let pod_id = format!("pod-{}", uuid::Uuid::new_v4().simple());
        tracing::info!(pod_id = %pod_id, "assembling voice gateway");

        let redis_client = redis::Client::open(config.redis.url())?;
        let redis_manager = redis_client.get_connection_manager().await?;
        tracing::info!(host = %config.redis.host, "session store connected");

        let registry = Arc::new(SessionRegistry::new(redis_manager.clone(), pod_id));
        let cleanup_bus = Arc::new(CleanupBus::new(redis_client.clone(), redis_manager.clone()));
        let task_bus = Arc::new(TaskBus::new(redis_client, redis_manager));

        let event_bus = Arc::new(EventBus::new());
        event_bus.use_middleware(Arc::new(RecoveryMiddleware));
        event_bus.use_middleware(Arc::new(LoggingMiddleware));
        event_bus.use_middleware(Arc::new(MetricsMiddleware::new(Arc::clone(event_bus.stats()))));
        event_bus.use_middleware(Arc::new(TimeoutMiddleware::new(
            std::time::Duration::from_secs(10),
        )));
        event_bus.use_middleware(Arc::new(ValidationMiddleware));
        // Generous ceiling: protects against event storms, invisible to
        // normal call volumes.
        event_bus.use_middleware(Arc::new(RateLimitMiddleware::new(
            10_000,
            std::time::Duration::from_secs(60),
        )));
        event_bus.use_middleware(Arc::new(DeduplicationMiddleware::new(
            std::time::Duration::from_millis(250),
        )));

        let agent_cache = AgentCache::new();
        let recorder = Arc::new(Recorder::new(AudioStorage::from_config(&config.storage)));
        if recorder.is_enabled() {
            tracing::info!(kind = ?config.storage.kind, "audio recording enabled");
        }
        let ice = Arc::new(IceProvider::new(&config.ice));
        let webrtc = Arc::new(WebRtcProcessor::new(
            Arc::clone(&ice),
            Arc::clone(&event_bus),
            Arc::clone(&recorder),
        )?);

        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
        let usage = Arc::new(UsagePublisher::new(config.pubsub.as_ref()));
        if usage.is_enabled() {
            tracing::info!("usage publisher enabled");
        }

        let sessions = SessionManager::new(
            Arc::clone(&registry),
            Arc::clone(&cleanup_bus),
            Arc::clone(&webrtc),
            Arc::clone(&store),
            Arc::clone(&usage),
            Arc::clone(&recorder),
            Arc::clone(&event_bus),
            Arc::clone(&agent_cache),
        );

        let wati = WatiClient::new(&config.wati);

        Ok(Arc::new(Self {
            config,
            event_bus,
            agent_cache,
            sessions,
            webrtc,
            ice,
            wati,
            task_bus,
            cleanup_bus,
            recorder,
            store,
            usage,
            started_at: Instant::now(),
            pending_permissions: Mutex::new(HashMap::new()),
            livekit_rooms: Mutex::new(HashMap::new()),
        }))
    }

    /// Start the cross-pod subscribers and periodic loops.
    pub fn spawn_background(self: Arc<Self>) {
        // Cleanup broadcasts → local idempotent cleanup.
        {
            let app = Arc::clone(&self);
            self.cleanup_bus.spawn_subscriber(Arc::new(move |session_id| {
                let app = Arc::clone(&app);
                Box::pin(async move {
                    app.sessions.handle_cleanup_broadcast(&session_id).await;
                })
            }));
        }
        // Task fan-out → this pod acts only on sessions it owns.
        {
            let app = Arc::clone(&self);
            self.task_bus.spawn_subscriber(Arc::new(move |task| {
                let app = Arc::clone(&app);
                Box::pin(async move {
                    crate::channels::dispatch_task(app, task).await;
                })
            }));
        }
        Arc::clone(&self.recorder).spawn_sweep_loop();
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
