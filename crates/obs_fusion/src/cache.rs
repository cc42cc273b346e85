//! Opt-in read-through cache owned by one reader session.
//!
//! Entries are keyed by `(version, id)` since legacy protocol versions map
//! some ids to different phenomena. The cache is dropped with its session.

use std::collections::HashMap;

use crate::model::{Phenomenon, SamplingFeature};

type CacheKey = (String, String);

fn key(version: Option<&str>, id: &str) -> CacheKey {
    (version.unwrap_or_default().to_string(), id.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    features: HashMap<CacheKey, SamplingFeature>,
    phenomena: HashMap<CacheKey, Phenomenon>,
    hits: u64,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feature(&mut self, version: Option<&str>, id: &str) -> Option<SamplingFeature> {
        let found = self.features.get(&key(version, id)).cloned();
        self.hits += u64::from(found.is_some());
        found
    }

    pub fn put_feature(&mut self, version: Option<&str>, feature: SamplingFeature) {
        self.features.insert(key(version, &feature.id), feature);
    }

    pub fn phenomenon(&mut self, version: Option<&str>, id: &str) -> Option<Phenomenon> {
        let found = self.phenomena.get(&key(version, id)).cloned();
        self.hits += u64::from(found.is_some());
        found
    }

    /// Stores `phenomenon` under the id it was requested with.
    pub fn put_phenomenon(&mut self, version: Option<&str>, id: &str, phenomenon: Phenomenon) {
        self.phenomena.insert(key(version, id), phenomenon);
    }

    /// Lookups answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.features.len() + self.phenomena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.features.clear();
        self.phenomena.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SinglePhenomenon;

    #[test]
    fn entries_are_scoped_by_version() {
        let mut cache = SessionCache::new();
        cache.put_phenomenon(
            Some("1.0.0"),
            "urn:ogc:def:phenomenon:GEOSS:depth",
            Phenomenon::Single(SinglePhenomenon::new("depth")),
        );
        assert!(cache
            .phenomenon(Some("2.0.0"), "urn:ogc:def:phenomenon:GEOSS:depth")
            .is_none());
        let hit = cache
            .phenomenon(Some("1.0.0"), "urn:ogc:def:phenomenon:GEOSS:depth")
            .expect("cached");
        assert_eq!(hit.id(), "depth");
        assert_eq!(cache.hits(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
