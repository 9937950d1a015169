//! ICE server assembly.
//!
//! The client configuration merges the static STUN list from the
//! environment with TURN credentials minted on demand through the Twilio
//! token API. Minted credentials are cached briefly; Twilio tokens live for
//! an hour by default.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::IceConfig;

/// How long minted TURN credentials are reused before a fresh mint.
const TURN_CACHE_TTL: Duration = Duration::from_secs(45 * 60);

/// Deadline on the Twilio token call.
const TURN_MINT_DEADLINE: Duration = Duration::from_secs(5);

/// One entry of the client-facing `iceServers` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Response shape of `GET /api/webrtc/config`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcClientConfig {
    pub ice_servers: Vec<IceServerEntry>,
    pub ice_candidate_pool_size: u32,
}

pub struct IceProvider {
    static_servers: Vec<IceServerEntry>,
    twilio: Option<TwilioTurnClient>,
    cache: Mutex<Option<(Instant, Vec<IceServerEntry>)>>,
}

impl IceProvider {
    pub fn new(config: &IceConfig) -> Self {
        let mut static_servers = Vec::new();
        if !config.stun_servers.is_empty() {
            static_servers.push(IceServerEntry {
                urls: config.stun_servers.clone(),
                username: None,
                credential: None,
            });
        }
        let twilio = match (&config.twilio_account_sid, &config.twilio_auth_token) {
            (Some(sid), Some(token)) => Some(TwilioTurnClient::new(sid.clone(), token.clone())),
            _ => None,
        };
        Self {
            static_servers,
            twilio,
            cache: Mutex::new(None),
        }
    }

    /// The merged ICE-server list: static STUN plus cached or freshly
    /// minted TURN entries. TURN failures degrade to STUN-only.
    pub async fn ice_servers(&self) -> Vec<IceServerEntry> {
        let mut servers = self.static_servers.clone();
        let Some(twilio) = &self.twilio else {
            return servers;
        };

        let mut cache = self.cache.lock().await;
        let fresh = match &*cache {
            Some((minted, turn)) if minted.elapsed() < TURN_CACHE_TTL => Some(turn.clone()),
            _ => None,
        };
        let turn = match fresh {
            Some(turn) => turn,
            None => match twilio.mint_turn_servers().await {
                Ok(turn) => {
                    *cache = Some((Instant::now(), turn.clone()));
                    turn
                }
                Err(e) => {
                    tracing::warn!(error = %e, "TURN mint failed; serving STUN only");
                    Vec::new()
                }
            },
        };
        servers.extend(turn);
        servers
    }

    pub async fn client_config(&self) -> WebRtcClientConfig {
        WebRtcClientConfig {
            ice_servers: self.ice_servers().await,
            ice_candidate_pool_size: 10,
        }
    }
}

// ── Twilio token client ────────────────────────────────────────────

pub struct TwilioTurnClient {
    account_sid: String,
    auth_token: String,
    client: reqwest::Client,
    base_url: String,
}

impl TwilioTurnClient {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        Self {
            account_sid,
            auth_token,
            client: reqwest::Client::new(),
            base_url: "https://api.twilio.com".to_owned(),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_owned();
        self
    }

    /// Mint a short-lived TURN token.
    pub async fn mint_turn_servers(&self) -> anyhow::Result<Vec<IceServerEntry>> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Tokens.json",
            self.base_url, self.account_sid
        );
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .timeout(TURN_MINT_DEADLINE)
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        Ok(parse_twilio_token(&body))
    }
}

/// Extract TURN entries from a Twilio token response, skipping plain STUN
/// rows (the static list already covers STUN).
fn parse_twilio_token(body: &serde_json::Value) -> Vec<IceServerEntry> {
    let Some(list) = body.get("ice_servers").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|entry| {
            let url = entry
                .get("urls")
                .or_else(|| entry.get("url"))
                .and_then(|v| v.as_str())?
                .to_owned();
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                return None;
            }
            Some(IceServerEntry {
                urls: vec![url],
                username: entry.get("username").and_then(|v| v.as_str()).map(ToOwned::to_owned),
                credential: entry
                    .get("credential")
                    .and_then(|v| v.as_str())
                    .map(ToOwned::to_owned),
            })
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ice_config(twilio: bool) -> IceConfig {
        IceConfig {
            stun_servers: vec!["stun:stun.example:3478".into()],
            twilio_account_sid: twilio.then(|| "AC123".into()),
            twilio_auth_token: twilio.then(|| "token".into()),
        }
    }

    #[tokio::test]
    async fn stun_only_without_twilio() {
        let provider = IceProvider::new(&ice_config(false));
        let servers = provider.ice_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:stun.example:3478"]);
        assert!(servers[0].username.is_none());
    }

    #[tokio::test]
    async fn client_config_shape() {
        let provider = IceProvider::new(&ice_config(false));
        let config = provider.client_config().await;
        assert_eq!(config.ice_candidate_pool_size, 10);

        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("iceServers").is_some());
        assert_eq!(json["iceCandidatePoolSize"], 10);
        // Credential-less entries serialize without the optional fields.
        assert!(json["iceServers"][0].get("username").is_none());
    }

    #[test]
    fn twilio_parse_keeps_turn_drops_stun() {
        let body = serde_json::json!({
            "ice_servers": [
                {"url": "stun:global.stun.twilio.com:3478"},
                {"url": "turn:global.turn.twilio.com:3478?transport=udp",
                 "username": "u1", "credential": "c1"},
                {"urls": "turns:global.turn.twilio.com:443?transport=tcp",
                 "username": "u1", "credential": "c1"}
            ]
        });
        let servers = parse_twilio_token(&body);
        assert_eq!(servers.len(), 2);
        assert!(servers[0].urls[0].starts_with("turn:"));
        assert_eq!(servers[0].username.as_deref(), Some("u1"));
        assert!(servers[1].urls[0].starts_with("turns:"));
    }

    #[test]
    fn twilio_parse_tolerates_missing_fields() {
        assert!(parse_twilio_token(&serde_json::json!({})).is_empty());
        assert!(parse_twilio_token(&serde_json::json!({"ice_servers": [{}]})).is_empty());
    }

    #[tokio::test]
    async fn mint_failure_degrades_to_stun_only() {
        let mut config = ice_config(true);
        config.twilio_account_sid = Some("AC123".into());
        let provider = IceProvider {
            static_servers: vec![IceServerEntry {
                urls: vec!["stun:stun.example:3478".into()],
                username: None,
                credential: None,
            }],
            // Unroutable base URL: the mint fails fast.
            twilio: Some(
                TwilioTurnClient::new("AC123".into(), "token".into())
                    .with_base_url("http://127.0.0.1:1"),
            ),
            cache: Mutex::new(None),
        };
        let servers = provider.ice_servers().await;
        assert_eq!(servers.len(), 1);
    }
}
