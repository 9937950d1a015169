use std::sync::Arc;

use astra_voice::agents::{spawn_refresh_loop, AgentConfig, StaticAgentSource, REFRESH_INTERVAL};
use astra_voice::app::VoiceApp;
use astra_voice::config::Config;
use astra_voice::gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let app = VoiceApp::build(config).await?;
    Arc::clone(&app).spawn_background();

    // Agent configurations come from the periodic database refresh in
    // production; a JSON seed file stands in for it on development setups.
    match std::env::var("AGENTS_SEED_PATH") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("cannot read agent seed {path}: {e}"))?;
            let agents: Vec<AgentConfig> = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("invalid agent seed {path}: {e}"))?;
            tracing::info!(count = agents.len(), path = %path, "agent seed loaded");
            spawn_refresh_loop(
                Arc::clone(&app.agent_cache),
                Arc::new(StaticAgentSource::new(agents)),
                REFRESH_INTERVAL,
            );
        }
        Err(_) => {
            tracing::warn!("no agent source configured; agent cache starts empty");
        }
    }

    gateway::run(app).await
}
