use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bundlekit_core::Manifest;
use bundlekit_installer::{current_unix_timestamp, write_atomic};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::download::FetchClient;
use crate::retry::run_with_retry;

const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CachedManifest {
    version: u32,
    source_url: String,
    fetched_at_unix: u64,
    body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLoad {
    Fresh(Manifest),
    Cached {
        manifest: Manifest,
        fetched_at_unix: u64,
    },
    Unavailable {
        reason: String,
    },
}

impl ManifestLoad {
    pub fn manifest(&self) -> Option<&Manifest> {
        match self {
            Self::Fresh(manifest) | Self::Cached { manifest, .. } => Some(manifest),
            Self::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestSource {
    url: String,
    cache_path: PathBuf,
}

impl ManifestSource {
    pub fn new(url: impl Into<String>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            cache_path: cache_path.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn fresh_cached(&self, max_age: Duration) -> Option<Manifest> {
        let cached = self.read_cache()?;
        let age = current_unix_timestamp().saturating_sub(cached.fetched_at_unix);
        if age >= max_age.as_secs() {
            debug!(age, "cached manifest is stale");
            return None;
        }
        debug!(age, "using fresh cached manifest");
        Manifest::from_toml_str(&cached.body).ok()
    }

    pub fn load(&self, client: &FetchClient) -> ManifestLoad {
        let fetched = run_with_retry(client.policy(), "manifest", |_| client.get_text(&self.url))
            .and_then(|body| {
                let manifest = Manifest::from_toml_str(&body)
                    .with_context(|| format!("manifest from {} is invalid", self.url))?;
                Ok((manifest, body))
            });

        match fetched {
            Ok((manifest, body)) => {
                if let Err(err) = self.write_cache(body) {
                    warn!(error = %format!("{err:#}"), "failed to cache manifest");
                }
                ManifestLoad::Fresh(manifest)
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(url = %self.url, error = %reason, "could not reach the server for the manifest");
                match self.read_cache().and_then(|cached| {
                    let manifest = Manifest::from_toml_str(&cached.body).ok()?;
                    Some((manifest, cached.fetched_at_unix))
                }) {
                    Some((manifest, fetched_at_unix)) => {
                        info!(fetched_at_unix, "using last cached manifest");
                        ManifestLoad::Cached {
                            manifest,
                            fetched_at_unix,
                        }
                    }
                    None => ManifestLoad::Unavailable { reason },
                }
            }
        }
    }

    fn read_cache(&self) -> Option<CachedManifest> {
        let raw = match fs::read_to_string(&self.cache_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.cache_path.display(), error = %err, "failed to read manifest cache");
                return None;
            }
        };
        let cached: CachedManifest = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(path = %self.cache_path.display(), error = %err, "ignoring corrupt manifest cache");
                return None;
            }
        };
        if cached.version != CACHE_FORMAT_VERSION || cached.source_url != self.url {
            debug!(source_url = %cached.source_url, "manifest cache belongs to another endpoint");
            return None;
        }
        Some(cached)
    }

    fn write_cache(&self, body: String) -> Result<()> {
        let cached = CachedManifest {
            version: CACHE_FORMAT_VERSION,
            source_url: self.url.clone(),
            fetched_at_unix: current_unix_timestamp(),
            body,
        };
        let encoded = serde_json::to_vec_pretty(&cached).context("failed to encode manifest cache")?;
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        write_atomic(&self.cache_path, &encoded)
    }
}
