//! Thread-safe agent-configuration cache with a Draft/Published dual index.
//!
//! Reads return deep copies; the cache never leaks references into its
//! internal maps. Bulk refreshes arrive through a bounded queue and are
//! applied by a single worker as an atomic replacement of both indices.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::AgentConfig;

/// Key suffix marking the Draft variant of an agent.
pub const DRAFT_SUFFIX: &str = ":draft";

/// Capacity of the bulk-refresh queue.
const UPDATE_QUEUE_DEPTH: usize = 16;

#[derive(Default)]
struct CacheInner {
    /// Primary index: agent id (optionally `:draft`-suffixed) → config.
    by_id: HashMap<String, AgentConfig>,
    /// Secondary index: text agent id (same suffix rule) → primary key.
    by_text_id: HashMap<String, String>,
}

impl CacheInner {
    fn insert(&mut self, agent: AgentConfig) {
        if let Some(text_id) = &agent.text_agent_id {
            self.by_text_id.insert(text_id.clone(), agent.id.clone());
        }
        self.by_id.insert(agent.id.clone(), agent);
    }

    fn remove(&mut self, key: &str) -> Option<AgentConfig> {
        let agent = self.by_id.remove(key)?;
        if let Some(text_id) = &agent.text_agent_id {
            self.by_text_id.remove(text_id);
        }
        Some(agent)
    }

    fn rebuild(agents: Vec<AgentConfig>) -> Self {
        let mut inner = Self::default();
        for agent in agents {
            // Duplicate ids within a refresh keep the first occurrence.
            if inner.by_id.contains_key(&agent.id) {
                tracing::warn!(agent_id = %agent.id, "duplicate agent id in refresh batch; skipped");
                continue;
            }
            inner.insert(agent);
        }
        inner
    }
}

pub struct AgentCache {
    inner: Arc<RwLock<CacheInner>>,
    update_tx: mpsc::Sender<Vec<AgentConfig>>,
}

impl AgentCache {
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(RwLock::new(CacheInner::default()));
        let (update_tx, mut update_rx) = mpsc::channel::<Vec<AgentConfig>>(UPDATE_QUEUE_DEPTH);

        // Single refresh worker: build both indices off-lock, then swap.
        let worker_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(agents) = update_rx.recv().await {
                let count = agents.len();
                let rebuilt = CacheInner::rebuild(agents);
                *worker_inner.write() = rebuilt;
                tracing::info!(agents = count, "agent cache refreshed");
            }
        });

        Arc::new(Self { inner, update_tx })
    }

    /// Cache without the background worker, for synchronous tests.
    #[cfg(test)]
    pub fn new_detached() -> Self {
        let (update_tx, _update_rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
        Self {
            inner: Arc::new(RwLock::new(CacheInner::default())),
            update_tx,
        }
    }

    /// Look up an agent. Resolution order:
    ///   1. the key as a primary id,
    ///   2. the key as a text-agent alias,
    ///   3. the key's Draft variant (`key:draft`, directly or via alias),
    ///      returned as a virtual Published config with the suffix stripped.
    ///
    /// Always returns a deep copy.
    pub fn get(&self, key: &str) -> Option<AgentConfig> {
        let inner = self.inner.read();

        if let Some(agent) = inner.by_id.get(key) {
            return Some(agent.clone());
        }
        if let Some(primary) = inner.by_text_id.get(key) {
            if let Some(agent) = inner.by_id.get(primary) {
                return Some(agent.clone());
            }
        }

        // Draft-only agent: serve the Draft as a virtual Published config.
        let draft_key = format!("{key}{DRAFT_SUFFIX}");
        let draft = inner
            .by_id
            .get(&draft_key)
            .or_else(|| {
                inner
                    .by_text_id
                    .get(&draft_key)
                    .and_then(|primary| inner.by_id.get(primary))
            })?
            .clone();
        Some(strip_draft_suffix(draft))
    }

    /// Insert or replace one entry, maintaining both indices.
    pub fn upsert(&self, agent: AgentConfig) {
        let mut inner = self.inner.write();
        // Replacing an entry must not leave its old alias behind.
        inner.remove(&agent.id);
        inner.insert(agent);
    }

    /// Remove one entry by primary key, maintaining both indices.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    /// Queue a bulk refresh. Returns false when the queue is full (the
    /// periodic refresher will retry on its next tick).
    pub fn update_agents_async(&self, agents: Vec<AgentConfig>) -> bool {
        match self.update_tx.try_send(agents) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("agent cache refresh queue full; batch dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Synchronous atomic replacement of the whole cache.
    pub fn replace_all(&self, agents: Vec<AgentConfig>) {
        let rebuilt = CacheInner::rebuild(agents);
        *self.inner.write() = rebuilt;
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strip the `:draft` suffix from a Draft entry's id and alias so the caller
/// sees a regular Published-shaped config.
fn strip_draft_suffix(mut agent: AgentConfig) -> AgentConfig {
    if let Some(stripped) = agent.id.strip_suffix(DRAFT_SUFFIX) {
        agent.id = stripped.to_owned();
    }
    if let Some(text_id) = agent.text_agent_id.take() {
        agent.text_agent_id = Some(
            text_id
                .strip_suffix(DRAFT_SUFFIX)
                .map(ToOwned::to_owned)
                .unwrap_or(text_id),
        );
    }
    agent
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(id: &str, tenant: &str) -> AgentConfig {
        let mut agent = AgentConfig::seed(id, tenant);
        agent.id = format!("{id}{DRAFT_SUFFIX}");
        agent
    }

    #[test]
    fn get_by_primary_id() {
        let cache = AgentCache::new_detached();
        cache.upsert(AgentConfig::seed("A1", "T1"));
        assert_eq!(cache.get("A1").unwrap().id, "A1");
        assert!(cache.get("A2").is_none());
    }

    #[test]
    fn get_by_text_agent_alias() {
        let cache = AgentCache::new_detached();
        let mut agent = AgentConfig::seed("A1", "T1");
        agent.text_agent_id = Some("text-a1".into());
        cache.upsert(agent);

        let found = cache.get("text-a1").unwrap();
        assert_eq!(found.id, "A1");
    }

    #[test]
    fn draft_only_agent_answers_as_virtual_published() {
        let cache = AgentCache::new_detached();
        let mut d = draft("A2", "T1");
        d.name = "draft name".into();
        cache.upsert(d);

        let found = cache.get("A2").unwrap();
        assert_eq!(found.id, "A2");
        assert!(!found.id.ends_with(DRAFT_SUFFIX));
        assert_eq!(found.name, "draft name");
    }

    #[test]
    fn published_wins_over_draft() {
        let cache = AgentCache::new_detached();
        let mut published = AgentConfig::seed("A2", "T1");
        published.name = "published".into();
        let mut d = draft("A2", "T1");
        d.name = "draft".into();
        cache.upsert(d);
        cache.upsert(published);

        assert_eq!(cache.get("A2").unwrap().name, "published");
        // Explicit draft key still reaches the Draft variant.
        assert_eq!(cache.get(&format!("A2{DRAFT_SUFFIX}")).unwrap().name, "draft");
    }

    #[test]
    fn reads_are_deep_copies() {
        let cache = AgentCache::new_detached();
        cache.upsert(AgentConfig::seed("A1", "T1"));

        let mut first = cache.get("A1").unwrap();
        first.name = "mutated".into();
        first.prompt_config.greeting = "mutated".into();

        let second = cache.get("A1").unwrap();
        assert_eq!(second.name, "A1");
        assert_eq!(second.prompt_config.greeting, "");
    }

    #[test]
    fn delete_clears_both_indices() {
        let cache = AgentCache::new_detached();
        let mut agent = AgentConfig::seed("A1", "T1");
        agent.text_agent_id = Some("text-a1".into());
        cache.upsert(agent);

        assert!(cache.delete("A1"));
        assert!(cache.get("A1").is_none());
        assert!(cache.get("text-a1").is_none());
        assert!(!cache.delete("A1"));
    }

    #[test]
    fn upsert_replaces_stale_alias() {
        let cache = AgentCache::new_detached();
        let mut agent = AgentConfig::seed("A1", "T1");
        agent.text_agent_id = Some("old-alias".into());
        cache.upsert(agent);

        let mut renamed = AgentConfig::seed("A1", "T1");
        renamed.text_agent_id = Some("new-alias".into());
        cache.upsert(renamed);

        assert!(cache.get("old-alias").is_none());
        assert_eq!(cache.get("new-alias").unwrap().id, "A1");
    }

    #[test]
    fn replace_all_dedupes_batch() {
        let cache = AgentCache::new_detached();
        let mut first = AgentConfig::seed("A1", "T1");
        first.name = "first".into();
        let mut second = AgentConfig::seed("A1", "T1");
        second.name = "second".into();

        cache.replace_all(vec![first, second, AgentConfig::seed("A2", "T1")]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("A1").unwrap().name, "first");
    }

    #[test]
    fn replace_all_drops_absent_entries() {
        let cache = AgentCache::new_detached();
        cache.upsert(AgentConfig::seed("A1", "T1"));
        cache.replace_all(vec![AgentConfig::seed("A2", "T1")]);
        assert!(cache.get("A1").is_none());
        assert!(cache.get("A2").is_some());
    }

    #[tokio::test]
    async fn async_update_applies_through_worker() {
        let cache = AgentCache::new();
        assert!(cache.update_agents_async(vec![AgentConfig::seed("A1", "T1")]));

        // The worker applies the batch asynchronously.
        for _ in 0..50 {
            if cache.get("A1").is_some() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("refresh batch was never applied");
    }
}
