//! Track catalog boundary
//!
//! The catalog owns titles, artwork and remote locations. The engine only
//! needs the remote URLs and declared sizes of each quality variant.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::model::Variant;

/// Remote locations of one track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub uid: String,
    pub remote_url_hi: Option<String>,
    pub remote_url_lo: Option<String>,
    pub declared_size_hi: Option<u64>,
    pub declared_size_lo: Option<u64>,
}

impl CatalogEntry {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Default::default()
        }
    }

    pub fn with_hi(mut self, url: impl Into<String>, declared_size: Option<u64>) -> Self {
        self.remote_url_hi = Some(url.into());
        self.declared_size_hi = declared_size;
        self
    }

    pub fn with_lo(mut self, url: impl Into<String>, declared_size: Option<u64>) -> Self {
        self.remote_url_lo = Some(url.into());
        self.declared_size_lo = declared_size;
        self
    }

    pub fn url_for(&self, variant: Variant) -> Option<&str> {
        match variant {
            Variant::Hi => self.remote_url_hi.as_deref(),
            Variant::Lo => self.remote_url_lo.as_deref(),
        }
    }

    pub fn declared_size(&self, variant: Variant) -> Option<u64> {
        match variant {
            Variant::Hi => self.declared_size_hi,
            Variant::Lo => self.declared_size_lo,
        }
    }

    /// URL for `preferred`, else the other variant's URL.
    pub fn best_url(&self, preferred: Variant) -> Option<(Variant, &str)> {
        self.url_for(preferred)
            .map(|url| (preferred, url))
            .or_else(|| {
                let other = preferred.other();
                self.url_for(other).map(|url| (other, url))
            })
    }
}

/// Source of catalog entries.
#[async_trait]
pub trait TrackCatalog: Send + Sync {
    /// Look up one track. `None` when the uid is unknown.
    async fn entry(&self, uid: &str) -> Result<Option<CatalogEntry>>;

    /// URL of a non-audio asset (artwork, lyrics sidecar).
    async fn asset_url(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// In-memory catalog, filled by the host.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    entries: RwLock<HashMap<String, CatalogEntry>>,
    assets: RwLock<HashMap<String, String>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let catalog = Self::new();
        for entry in entries {
            catalog.insert(entry);
        }
        catalog
    }

    pub fn insert(&self, entry: CatalogEntry) {
        self.entries.write().insert(entry.uid.clone(), entry);
    }

    pub fn remove(&self, uid: &str) -> Option<CatalogEntry> {
        self.entries.write().remove(uid)
    }

    pub fn insert_asset(&self, key: impl Into<String>, url: impl Into<String>) {
        self.assets.write().insert(key.into(), url.into());
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl TrackCatalog for StaticCatalog {
    async fn entry(&self, uid: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.entries.read().get(uid).cloned())
    }

    async fn asset_url(&self, key: &str) -> Result<Option<String>> {
        Ok(self.assets.read().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_url_falls_back() {
        let entry = CatalogEntry::new("a").with_lo("https://cdn/a.lo", Some(100));

        assert_eq!(entry.best_url(Variant::Lo), Some((Variant::Lo, "https://cdn/a.lo")));
        assert_eq!(entry.best_url(Variant::Hi), Some((Variant::Lo, "https://cdn/a.lo")));
        assert_eq!(entry.declared_size(Variant::Hi), None);
        assert_eq!(CatalogEntry::new("b").best_url(Variant::Hi), None);
    }

    #[tokio::test]
    async fn test_static_catalog() {
        let catalog = StaticCatalog::from_entries([
            CatalogEntry::new("a").with_hi("https://cdn/a.hi", Some(200)),
        ]);
        catalog.insert_asset("art:a", "https://cdn/a.jpg");

        assert_eq!(catalog.len(), 1);
        assert!(catalog.entry("a").await.unwrap().is_some());
        assert!(catalog.entry("zzz").await.unwrap().is_none());
        assert_eq!(
            catalog.asset_url("art:a").await.unwrap().as_deref(),
            Some("https://cdn/a.jpg")
        );

        catalog.remove("a");
        assert!(catalog.is_empty());
    }
}
