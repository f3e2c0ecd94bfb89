//! Track Resolver
//!
//! Decides where a track plays from: an exact local copy, the network, or a
//! local copy at the other quality.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::catalog::TrackCatalog;
use crate::connectivity::Connectivity;
use crate::error::{OfflineError, Result};
use crate::model::{AudioBlob, Variant};
use crate::policy::PolicyStore;
use crate::store::CacheStore;

/// Where the bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    Local(AudioBlob),
    Network { url: String },
}

/// Answer to `resolve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub uid: String,
    pub source: PlaybackSource,
    pub effective_quality: Variant,
    pub is_local: bool,
    /// Local copy at a quality other than the one requested.
    pub degraded: bool,
}

impl ResolvedSource {
    pub fn url(&self) -> Option<&str> {
        match &self.source {
            PlaybackSource::Network { url } => Some(url),
            PlaybackSource::Local(_) => None,
        }
    }

    pub fn blob(&self) -> Option<&AudioBlob> {
        match &self.source {
            PlaybackSource::Local(blob) => Some(blob),
            PlaybackSource::Network { .. } => None,
        }
    }

    pub fn summary(&self) -> ResolvedSummary {
        ResolvedSummary {
            uid: self.uid.clone(),
            url: self.url().map(str::to_string),
            effective_quality: self.effective_quality,
            is_local: self.is_local,
            degraded: self.degraded,
        }
    }
}

/// Serializable view of a [`ResolvedSource`] without the audio bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedSummary {
    pub uid: String,
    pub url: Option<String>,
    pub effective_quality: Variant,
    pub is_local: bool,
    pub degraded: bool,
}

pub struct TrackResolver {
    store: Arc<dyn CacheStore>,
    policy: Arc<PolicyStore>,
    catalog: Arc<dyn TrackCatalog>,
    connectivity: Connectivity,
}

impl TrackResolver {
    pub fn new(
        store: Arc<dyn CacheStore>,
        policy: Arc<PolicyStore>,
        catalog: Arc<dyn TrackCatalog>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            store,
            policy,
            catalog,
            connectivity,
        }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, uid: &str) -> Result<ResolvedSource> {
        let desired = self.policy.active_playback_quality();
        let local = self.store.get_blob(uid).await?;

        if let Some(blob) = &local {
            if blob.variant == desired {
                self.store.touch(uid).await?;
                debug!(uid, quality = %desired, "Resolved to local copy");
                return Ok(ResolvedSource {
                    uid: uid.to_string(),
                    effective_quality: desired,
                    is_local: true,
                    degraded: false,
                    source: PlaybackSource::Local(blob.clone()),
                });
            }
        }

        let class = self.connectivity.current();
        if self.policy.network_allowed(class) {
            if let Some(entry) = self.catalog.entry(uid).await? {
                if let Some((variant, url)) = entry.best_url(desired) {
                    debug!(uid, quality = %variant, connection = class.as_str(), "Resolved to network");
                    return Ok(ResolvedSource {
                        uid: uid.to_string(),
                        source: PlaybackSource::Network {
                            url: url.to_string(),
                        },
                        effective_quality: variant,
                        is_local: false,
                        degraded: false,
                    });
                }
            }
        }

        if let Some(blob) = local {
            info!(uid, wanted = %desired, have = %blob.variant, "Playing degraded local copy");
            self.store.mark_needs_re_cache(uid).await?;
            self.store.touch(uid).await?;
            return Ok(ResolvedSource {
                uid: uid.to_string(),
                effective_quality: blob.variant,
                is_local: true,
                degraded: true,
                source: PlaybackSource::Local(blob),
            });
        }

        Err(OfflineError::SourceUnavailable(format!(
            "No local copy of {} and network playback is not allowed on {}",
            uid,
            class.as_str()
        )))
    }
}
