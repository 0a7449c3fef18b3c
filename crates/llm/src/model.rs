use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

pub const DEFAULT_MODEL: &str = "deepseek-r1:7b";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(rename = "size", default)]
    pub size_bytes: u64,
    #[serde(skip)]
    pub description: Option<String>,
}

impl Model {
    pub fn new(name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn display_size(&self) -> String {
        format_size(self.size_bytes)
    }
}

/// Shape of Ollama's `GET /api/tags`.
#[derive(Debug, Deserialize)]
pub(crate) struct TagsPayload {
    #[serde(default)]
    pub models: Vec<Model>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    Ollama,
    CacheFresh,
    CacheStaleFallback,
    StaticFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub source: ModelCatalogSource,
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_ollama(models: Vec<Model>) -> Self {
        Self {
            models,
            source: ModelCatalogSource::Ollama,
            warning: None,
        }
    }

    pub fn from_cache_fresh(models: Vec<Model>) -> Self {
        Self {
            models,
            source: ModelCatalogSource::CacheFresh,
            warning: None,
        }
    }

    pub fn from_cache_stale(models: Vec<Model>, warning: String) -> Self {
        Self {
            models,
            source: ModelCatalogSource::CacheStaleFallback,
            warning: Some(warning),
        }
    }

    pub fn from_static_fallback(models: Vec<Model>, warning: String) -> Self {
        Self {
            models,
            source: ModelCatalogSource::StaticFallback,
            warning: Some(warning),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.iter().any(|model| model.name == name)
    }
}

struct CacheEntry {
    models: Vec<Model>,
    fetched_at: Instant,
}

/// Last successful tag listing, shared by one backend.
pub struct ModelCache {
    entry: RwLock<Option<CacheEntry>>,
    ttl: Duration,
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            ttl,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }

    pub async fn get_fresh(&self) -> Option<Vec<Model>> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.models.clone())
    }

    pub async fn get_any(&self) -> Option<Vec<Model>> {
        let entry = self.entry.read().await;
        entry.as_ref().map(|entry| entry.models.clone())
    }

    pub async fn set(&self, models: Vec<Model>) {
        *self.entry.write().await = Some(CacheEntry {
            models,
            fetched_at: Instant::now(),
        });
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::with_default_ttl()
    }
}

pub fn default_models() -> Vec<Model> {
    vec![Model::new(DEFAULT_MODEL, 0).with_description("Default reasoning model")]
}

/// Human-readable byte count, rounded to a whole number of the largest unit.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{} {}", value.round() as u64, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "2 KB");
        assert_eq!(format_size(4_683_087_332), "4 GB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 * 1024), "3072 GB");
    }

    #[test]
    fn tags_payload_reads_name_and_size() {
        let payload: TagsPayload = serde_json::from_str(
            r#"{"models":[{"name":"llama3:8b","size":4661224676,"digest":"abc"}]}"#,
        )
        .unwrap();
        assert_eq!(payload.models, vec![Model::new("llama3:8b", 4_661_224_676)]);
    }

    #[tokio::test]
    async fn cache_goes_stale_after_ttl() {
        let cache = ModelCache::new(Duration::ZERO);
        assert!(cache.get_any().await.is_none());

        cache.set(default_models()).await;
        assert!(cache.get_fresh().await.is_none());
        assert_eq!(cache.get_any().await, Some(default_models()));
    }
}
