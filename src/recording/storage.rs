//! Recording upload sink.
//!
//! Recordings land either in a local directory (development, single pod) or
//! in a cloud bucket through the GCS JSON upload API.

use std::path::{Path, PathBuf};

use crate::config::{StorageConfig, StorageKind};

/// Object key for one recording artifact.
pub fn object_name(conversation_id: &str, part: &str) -> String {
    format!("whatsappcall/conversation_{conversation_id}_{part}.opus")
}

pub enum AudioStorage {
    Disabled,
    Local { dir: PathBuf },
    Gcs { bucket: String, client: reqwest::Client },
}

impl AudioStorage {
    pub fn from_config(config: &StorageConfig) -> Self {
        if !config.enabled {
            return Self::Disabled;
        }
        match config.kind {
            StorageKind::Local => Self::Local {
                dir: PathBuf::from(&config.path),
            },
            StorageKind::Gcs => Self::Gcs {
                bucket: config.path.clone(),
                client: reqwest::Client::new(),
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Store one file under `object`; returns the destination path or URL.
    pub async fn store(&self, local: &Path, object: &str) -> anyhow::Result<String> {
        match self {
            Self::Disabled => anyhow::bail!("audio storage is disabled"),
            Self::Local { dir } => {
                let destination = dir.join(object);
                if let Some(parent) = destination.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(local, &destination).await?;
                Ok(destination.to_string_lossy().into_owned())
            }
            Self::Gcs { bucket, client } => {
                let body = tokio::fs::read(local).await?;
                let url = format!(
                    "https://storage.googleapis.com/upload/storage/v1/b/{bucket}/o?uploadType=media&name={}",
                    urlencode(object)
                );
                let mut request = client
                    .post(&url)
                    .header("Content-Type", "audio/ogg")
                    .body(body);
                // Workload-identity metadata tokens are injected by the
                // platform; a static token can override for development.
                if let Ok(token) = std::env::var("AUDIO_STORAGE_TOKEN") {
                    request = request.bearer_auth(token);
                }
                let response = request.send().await?.error_for_status()?;
                let _ = response.bytes().await;
                Ok(format!("gs://{bucket}/{object}"))
            }
        }
    }
}

/// Percent-encode an object name for the upload query string.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_match_persisted_layout() {
        assert_eq!(
            object_name("abc123", "merged"),
            "whatsappcall/conversation_abc123_merged.opus"
        );
        assert_eq!(
            object_name("abc123", "left"),
            "whatsappcall/conversation_abc123_left.opus"
        );
    }

    #[test]
    fn urlencode_keeps_unreserved() {
        assert_eq!(urlencode("abc-123_x.opus"), "abc-123_x.opus");
        assert_eq!(urlencode("a/b c"), "a%2Fb%20c");
    }

    #[tokio::test]
    async fn local_store_copies_into_dir() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("x.opus");
        tokio::fs::write(&src, b"opus").await.unwrap();

        let storage = AudioStorage::Local {
            dir: dst_dir.path().to_path_buf(),
        };
        let stored = storage
            .store(&src, &object_name("c1", "merged"))
            .await
            .unwrap();
        assert!(stored.ends_with("conversation_c1_merged.opus"));
        let copied = tokio::fs::read(&stored).await.unwrap();
        assert_eq!(copied, b"opus");
    }

    #[tokio::test]
    async fn disabled_store_refuses() {
        let storage = AudioStorage::from_config(&StorageConfig {
            enabled: false,
            kind: StorageKind::Local,
            path: "/tmp".into(),
        });
        assert!(!storage.is_enabled());
        assert!(storage.store(Path::new("/nonexistent"), "x").await.is_err());
    }
}
