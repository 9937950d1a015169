//! Agent configuration model and cache.
//!
//! Each agent exists in up to two concurrently cached variants: the
//! *Published* view (key = agent id) answering live calls and the *Draft*
//! view (key = `id + ":draft"`) used for previews while editing. A brand-new
//! agent that has never been published still answers calls through a
//! "virtual Published" built from its Draft.

mod cache;
mod refresh;

pub use cache::{AgentCache, DRAFT_SUFFIX};
pub use refresh::{spawn_refresh_loop, AgentSource, StaticAgentSource, REFRESH_INTERVAL};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prompt templates driving the two conversation phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Template for the opening line spoken before realtime mode.
    #[serde(default)]
    pub greeting: String,
    /// Template applied once the call switches to realtime.
    #[serde(default)]
    pub realtime: String,
    /// Provider system instructions.
    #[serde(default)]
    pub system_instructions: String,
    /// Per-language overrides, keyed by language code.
    #[serde(default)]
    pub language_map: HashMap<String, String>,
}

/// Prompt overrides used when the gateway dials out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundPromptConfig {
    #[serde(default)]
    pub greeting: String,
    #[serde(default)]
    pub system_instructions: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub top_k: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessRules {
    #[serde(default)]
    pub working_hours: Option<String>,
    #[serde(default)]
    pub escalation_number: Option<String>,
    #[serde(default)]
    pub max_call_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegratedAction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// One agent variant (Published or Draft) as cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    /// Alias used by text-channel integrations to address this agent.
    #[serde(default)]
    pub text_agent_id: Option<String>,
    pub tenant_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default)]
    pub prompt_config: PromptConfig,
    #[serde(default)]
    pub outbound_prompt_config: Option<OutboundPromptConfig>,
    #[serde(default)]
    pub rag_config: Option<RagConfig>,
    #[serde(default)]
    pub business_rules: Option<BusinessRules>,
    #[serde(default)]
    pub integrated_actions: Vec<IntegratedAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_speed() -> f32 {
    1.0
}

impl AgentConfig {
    /// Minimal config used by tests and development seeds.
    pub fn seed(id: &str, tenant_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_owned(),
            text_agent_id: None,
            tenant_id: tenant_id.to_owned(),
            name: id.to_owned(),
            is_active: true,
            language: "en".to_owned(),
            voice: "alloy".to_owned(),
            speed: 1.0,
            prompt_config: PromptConfig::default(),
            outbound_prompt_config: None,
            rag_config: None,
            business_rules: None,
            integrated_actions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this entry is the Draft variant, by key convention.
    pub fn is_draft(&self) -> bool {
        self.id.ends_with(DRAFT_SUFFIX)
    }

    /// Greeting instructions for the given language, falling back to the
    /// default greeting template.
    pub fn greeting_for(&self, language: &str) -> &str {
        self.prompt_config
            .language_map
            .get(language)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.prompt_config.greeting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_for_prefers_language_map() {
        let mut agent = AgentConfig::seed("A1", "T1");
        agent.prompt_config.greeting = "Hello!".into();
        agent
            .prompt_config
            .language_map
            .insert("es".into(), "¡Hola!".into());

        assert_eq!(agent.greeting_for("es"), "¡Hola!");
        assert_eq!(agent.greeting_for("fr"), "Hello!");
    }

    #[test]
    fn draft_detection_by_suffix() {
        let mut agent = AgentConfig::seed("A1", "T1");
        assert!(!agent.is_draft());
        agent.id.push_str(DRAFT_SUFFIX);
        assert!(agent.is_draft());
    }

    #[test]
    fn config_json_roundtrip() {
        let mut agent = AgentConfig::seed("A1", "T1");
        agent.text_agent_id = Some("text-a1".into());
        agent.integrated_actions.push(IntegratedAction {
            name: "book_slot".into(),
            description: "Book an appointment".into(),
            parameters: serde_json::json!({"type": "object"}),
        });

        let json = serde_json::to_string(&agent).unwrap();
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, agent);
    }
}
