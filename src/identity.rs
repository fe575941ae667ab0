//! Local Identity
//!
//! The member's own certificate and the cached member name.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::trust::Fingerprint;

/// Certificate this member presents to its peers
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// DER encoded certificate
    pub certificate: Vec<u8>,
    /// Digest pinned by the other members
    pub fingerprint: Fingerprint,
}

impl LocalIdentity {
    pub fn new(certificate: Vec<u8>) -> Self {
        let fingerprint = Fingerprint::of_certificate(&certificate);
        Self { certificate, fingerprint }
    }
}

struct CachedName {
    name: String,
    loaded: Instant,
}

/// Member name, backed by a small file and re-read at most once per TTL
pub struct NameCache {
    path: Option<PathBuf>,
    ttl: Duration,
    cached: RwLock<Option<CachedName>>,
}

impl NameCache {
    /// Name cache backed by `path`
    pub fn new(path: PathBuf, ttl: Duration) -> Self {
        Self {
            path: Some(path),
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Name cache that never touches the filesystem
    pub fn fixed(name: &str) -> Self {
        Self {
            path: None,
            ttl: Duration::MAX,
            cached: RwLock::new(Some(CachedName {
                name: name.to_string(),
                loaded: Instant::now(),
            })),
        }
    }

    /// Current member name
    pub async fn get(&self) -> String {
        if let Some(cached) = self.cached.read().await.as_ref() {
            if self.path.is_none() || cached.loaded.elapsed() < self.ttl {
                return cached.name.clone();
            }
        }

        let name = self.load().await;
        *self.cached.write().await = Some(CachedName {
            name: name.clone(),
            loaded: Instant::now(),
        });
        name
    }

    /// Persist a new member name (assigned by enrollment or configuration)
    pub async fn set(&self, name: &str) -> Result<()> {
        if let Some(path) = &self.path {
            write_name(path, name)?;
        }
        *self.cached.write().await = Some(CachedName {
            name: name.to_string(),
            loaded: Instant::now(),
        });
        Ok(())
    }

    async fn load(&self) -> String {
        let Some(path) = &self.path else {
            return short_hostname();
        };

        match tokio::fs::read_to_string(path).await {
            Ok(content) if !content.trim().is_empty() => content.trim().to_string(),
            _ => {
                let name = short_hostname();
                if let Err(e) = write_name(path, &name) {
                    tracing::warn!("Failed to record member name in {:?}: {}", path, e);
                }
                name
            }
        }
    }
}

fn write_name(path: &std::path::Path, name: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, name)?;
    Ok(())
}

fn short_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| h.split('.').next().map(str::to_string))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
