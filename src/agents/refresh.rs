//! Periodic agent-configuration refresh.
//!
//! Every active tenant's Published and Draft views are pulled from the
//! database seam and swapped into the cache in one batch. The interval is
//! jittered so a fleet of pods does not stampede the database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::AGENT_REFRESH_DEADLINE;

use super::{AgentCache, AgentConfig};

/// Default refresh cadence.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Source of agent configurations (the database seam).
#[async_trait]
pub trait AgentSource: Send + Sync {
    /// Load every variant (Published and Draft) for every active tenant.
    async fn load_active_agents(&self) -> anyhow::Result<Vec<AgentConfig>>;
}

/// Fixed agent set, for tests and single-tenant development.
pub struct StaticAgentSource {
    agents: Vec<AgentConfig>,
}

impl StaticAgentSource {
    pub fn new(agents: Vec<AgentConfig>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl AgentSource for StaticAgentSource {
    async fn load_active_agents(&self) -> anyhow::Result<Vec<AgentConfig>> {
        Ok(self.agents.clone())
    }
}

/// Spawn the refresh loop. The first pull happens immediately so the cache
/// is warm before the gateway starts accepting calls.
pub fn spawn_refresh_loop(
    cache: Arc<AgentCache>,
    source: Arc<dyn AgentSource>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(AGENT_REFRESH_DEADLINE, source.load_active_agents()).await {
                Ok(Ok(agents)) => {
                    if !cache.update_agents_async(agents) {
                        tracing::warn!("agent refresh batch not queued");
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "agent refresh pull failed; keeping cached view");
                }
                Err(_) => {
                    tracing::warn!(
                        deadline_s = AGENT_REFRESH_DEADLINE.as_secs(),
                        "agent refresh pull timed out; keeping cached view"
                    );
                }
            }
            tokio::time::sleep(jittered(interval)).await;
        }
    })
}

/// ±10 % jitter on the refresh interval.
fn jittered(interval: Duration) -> Duration {
    let base = interval.as_millis() as u64;
    if base == 0 {
        return interval;
    }
    let spread = base / 10;
    let low = base - spread;
    let high = base + spread;
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let interval = Duration::from_secs(300);
        for _ in 0..100 {
            let j = jittered(interval);
            assert!(j >= Duration::from_secs(270), "too low: {j:?}");
            assert!(j <= Duration::from_secs(330), "too high: {j:?}");
        }
    }

    #[tokio::test]
    async fn refresh_loop_populates_cache() {
        let cache = AgentCache::new();
        let source = Arc::new(StaticAgentSource::new(vec![AgentConfig::seed("A1", "T1")]));
        let handle = spawn_refresh_loop(Arc::clone(&cache), source, Duration::from_secs(300));

        for _ in 0..100 {
            if cache.get("A1").is_some() {
                handle.abort();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        panic!("cache was never populated by the refresh loop");
    }
}
