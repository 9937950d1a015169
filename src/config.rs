//! Environment-driven configuration for the voice gateway.
//!
//! Every deployment knob is an environment variable (the gateway runs as a
//! pod with injected env, never with a config file). `Config::from_env`
//! reads the process environment; the `from_lookup` constructor takes an
//! arbitrary lookup closure so tests can exercise parsing without touching
//! process globals.

use std::time::Duration;

/// Default HTTP listen port when `WHATSAPP_CALL_PORT` is unset.
pub const DEFAULT_PORT: u16 = 8089;

/// Deadline applied to every session-store (Redis) operation.
pub const STORE_OP_DEADLINE: Duration = Duration::from_secs(5);

/// Deadline for a single usage/metrics emission.
pub const METRICS_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for starting a LiveKit egress.
pub const EGRESS_START_DEADLINE: Duration = Duration::from_secs(10);

/// Ceiling for the outbound-call model-readiness poll.
pub const OUTBOUND_READY_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for one agent-configuration refresh pull.
pub const AGENT_REFRESH_DEADLINE: Duration = Duration::from_secs(60);

/// Deadline for the external audio merger process.
pub const MERGER_DEADLINE: Duration = Duration::from_secs(300);

/// Tenant id used when a channel does not supply one. Sessions attributed to
/// it never emit usage events.
pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub openai: OpenAiConfig,
    pub gemini: GeminiConfig,
    pub ice: IceConfig,
    pub wati: WatiConfig,
    pub livekit: Option<LiveKitConfig>,
    pub storage: StorageConfig,
    pub redis: RedisConfig,
    pub pubsub: Option<PubSubConfig>,
    /// HMAC secret for the management-page JWT (`X-API-Key`).
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct IceConfig {
    /// Static STUN URIs from `WHATSAPP_STUN_SERVERS` (comma-separated).
    pub stun_servers: Vec<String>,
    /// Twilio credentials for dynamic TURN minting, when both are present.
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WatiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Shared secret for `X-Hub-Signature-256` webhook verification.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LiveKitConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Object-storage bucket for room egress recordings.
    pub egress_bucket: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    Gcs,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub enabled: bool,
    pub kind: StorageKind,
    /// Local directory or cloud bucket name, depending on `kind`.
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db)
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub project_id: String,
    pub topic_name: String,
    /// Publisher identity recorded on every emitted event.
    pub pub_id: String,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup closure.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| get(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let port = match get("WHATSAPP_CALL_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("WHATSAPP_CALL_PORT is not a valid port: {raw}"))?,
            None => DEFAULT_PORT,
        };

        let openai = OpenAiConfig {
            api_key: get("OPENAI_API_KEY"),
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "wss://api.openai.com/v1/realtime".into()),
        };

        let gemini = GeminiConfig {
            api_key: get("GEMINI_API_KEY"),
            base_url: get("GEMINI_BASE_URL")
                .unwrap_or_else(|| "wss://generativelanguage.googleapis.com".into()),
            model: get("GEMINI_MODEL")
                .unwrap_or_else(|| "gemini-2.0-flash-live-001".into()),
        };

        let stun_servers = get("WHATSAPP_STUN_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_else(|| vec!["stun:stun.l.google.com:19302".into()]);

        let ice = IceConfig {
            stun_servers,
            twilio_account_sid: get("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: get("TWILIO_AUTH_TOKEN"),
        };

        let wati = WatiConfig {
            base_url: get("WATI_BASE_URL").unwrap_or_else(|| "https://live.wati.io".into()),
            api_key: get("WATI_API_KEY"),
            webhook_secret: get("WATI_WEBHOOK_SECRET"),
        };

        let livekit = match (get("LIVEKIT_URL"), get("LIVEKIT_API_KEY"), get("LIVEKIT_API_SECRET"))
        {
            (Some(url), Some(api_key), Some(api_secret)) => Some(LiveKitConfig {
                url,
                api_key,
                api_secret,
                egress_bucket: get("LIVEKIT_EGRESS_BUCKET"),
            }),
            _ => None,
        };

        let storage_kind = match get("AUDIO_STORAGE_TYPE").as_deref() {
            Some("gcs") | Some("cloud") => StorageKind::Gcs,
            _ => StorageKind::Local,
        };
        let storage = StorageConfig {
            enabled: get("AUDIO_STORAGE_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            kind: storage_kind,
            path: get("AUDIO_STORAGE_PATH").unwrap_or_else(|| "/tmp/astra-voice-audio".into()),
        };

        let redis = RedisConfig {
            host: get("REDIS_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: match get("REDIS_PORT") {
                Some(raw) => raw
                    .parse::<u16>()
                    .map_err(|_| anyhow::anyhow!("REDIS_PORT is not a valid port: {raw}"))?,
                None => 6379,
            },
            password: get("REDIS_PASSWORD"),
            db: get("REDIS_DB").and_then(|v| v.parse().ok()).unwrap_or(0),
        };

        let pubsub = match (get("PUBSUB_PROJECT_ID"), get("PUBSUB_TOPIC_NAME")) {
            (Some(project_id), Some(topic_name)) => Some(PubSubConfig {
                project_id,
                topic_name,
                pub_id: get("PUBSUB_PUB_ID").unwrap_or_else(|| "astra-voice".into()),
            }),
            _ => None,
        };

        let secret_key = get("SECRET_KEY").unwrap_or_else(|| "astra-voice-dev-secret".into());

        Ok(Self {
            port,
            openai,
            gemini,
            ice,
            wati,
            livekit,
            storage,
            redis,
            pubsub,
            secret_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + '_ {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| (*v).to_owned())
    }

    #[test]
    fn defaults_when_env_empty() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.openai.base_url, "wss://api.openai.com/v1/realtime");
        assert_eq!(config.ice.stun_servers, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.livekit.is_none());
        assert!(config.pubsub.is_none());
        assert!(!config.storage.enabled);
        assert_eq!(config.redis.url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn parses_port_and_redis() {
        let config = Config::from_lookup(lookup(&[
            ("WHATSAPP_CALL_PORT", "9100"),
            ("REDIS_HOST", "redis.internal"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "hunter2"),
            ("REDIS_DB", "3"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.redis.url(), "redis://:hunter2@redis.internal:6380/3");
    }

    #[test]
    fn invalid_port_is_an_error() {
        let err = Config::from_lookup(lookup(&[("WHATSAPP_CALL_PORT", "not-a-port")]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("WHATSAPP_CALL_PORT"));
    }

    #[test]
    fn stun_servers_split_and_trimmed() {
        let config = Config::from_lookup(lookup(&[(
            "WHATSAPP_STUN_SERVERS",
            "stun:a.example:3478, stun:b.example:3478 ,",
        )]))
        .unwrap();
        assert_eq!(
            config.ice.stun_servers,
            vec!["stun:a.example:3478", "stun:b.example:3478"]
        );
    }

    #[test]
    fn livekit_requires_all_three() {
        let config = Config::from_lookup(lookup(&[
            ("LIVEKIT_URL", "wss://lk.example"),
            ("LIVEKIT_API_KEY", "key"),
        ]))
        .unwrap();
        assert!(config.livekit.is_none());

        let config = Config::from_lookup(lookup(&[
            ("LIVEKIT_URL", "wss://lk.example"),
            ("LIVEKIT_API_KEY", "key"),
            ("LIVEKIT_API_SECRET", "secret"),
        ]))
        .unwrap();
        assert!(config.livekit.is_some());
    }

    #[test]
    fn storage_kind_parsing() {
        let config = Config::from_lookup(lookup(&[
            ("AUDIO_STORAGE_ENABLED", "true"),
            ("AUDIO_STORAGE_TYPE", "gcs"),
            ("AUDIO_STORAGE_PATH", "astra-recordings"),
        ]))
        .unwrap();
        assert!(config.storage.enabled);
        assert_eq!(config.storage.kind, StorageKind::Gcs);
        assert_eq!(config.storage.path, "astra-recordings");
    }

    #[test]
    fn blank_values_are_treated_as_unset() {
        let config = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "   ")])).unwrap();
        assert!(config.openai.api_key.is_none());
    }
}
