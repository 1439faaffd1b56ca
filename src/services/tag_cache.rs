//! Library-scoped tag identity cache.
//!
//! Maps normalized tag names to their Immich identity so the client can skip
//! redundant remote lookups and creates. Invalidation is wholesale: TTL
//! expiry, explicit invalidation, and name-collision recovery all drop the
//! entire cache, never individual keys.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::Tag;

/// Normalize a tag name for lookup: trim, then ASCII-lowercase.
/// The original casing is what gets sent on creation.
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Whether a tag name is acceptable to Immich.
///
/// Invalid names are silently excluded from tagging rather than surfaced as
/// errors: empty after trimming, longer than 100 characters, or containing
/// control characters.
pub fn is_valid_tag_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > 100 {
        return false;
    }
    // Validate what would actually be sent: leading/trailing whitespace
    // (newlines included) is trimmed away before creation.
    !trimmed.chars().any(|c| c.is_control())
}

#[derive(Debug)]
pub struct TagCache {
    entries: HashMap<String, Tag>,
    valid: bool,
    refreshed_at: Option<Instant>,
    ttl: Duration,
}

impl TagCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            valid: false,
            refreshed_at: None,
            ttl,
        }
    }

    /// A cache is fresh only while valid and within its TTL. A stale cache
    /// must be refreshed from source before serving lookups.
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        self.valid
            && self
                .refreshed_at
                .is_some_and(|at| now.duration_since(at) < self.ttl)
    }

    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.entries.get(&normalize(name))
    }

    pub fn insert(&mut self, tag: Tag) {
        self.entries.insert(normalize(&tag.name), tag);
    }

    /// Replace the whole cache with a freshly fetched tag list.
    pub fn replace_all(&mut self, tags: Vec<Tag>) {
        self.entries = tags.into_iter().map(|t| (normalize(&t.name), t)).collect();
        self.valid = true;
        self.refreshed_at = Some(Instant::now());
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.valid = false;
        self.refreshed_at = None;
    }

    pub fn iter_values(&self) -> impl Iterator<Item = &Tag> {
        self.entries.values()
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.remove(&normalize(name));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(id: &str, name: &str) -> Tag {
        Tag {
            id: id.to_string(),
            name: name.to_string(),
            value: None,
        }
    }

    #[test]
    fn lookup_is_case_insensitive_but_casing_is_kept() {
        let mut cache = TagCache::new(Duration::from_secs(300));
        cache.replace_all(vec![tag("t1", "Beach Sunset")]);

        let hit = cache.get("  beach sunset ").unwrap();
        assert_eq!(hit.id, "t1");
        assert_eq!(hit.name, "Beach Sunset");
    }

    #[test]
    fn fresh_within_ttl_stale_after() {
        let mut cache = TagCache::new(Duration::from_secs(300));
        assert!(!cache.is_fresh());

        cache.replace_all(vec![tag("t1", "sky")]);
        let populated_at = cache.refreshed_at.unwrap();
        assert!(cache.is_fresh_at(populated_at + Duration::from_secs(299)));
        assert!(!cache.is_fresh_at(populated_at + Duration::from_secs(301)));
    }

    #[test]
    fn invalidate_drops_everything() {
        let mut cache = TagCache::new(Duration::from_secs(300));
        cache.replace_all(vec![tag("t1", "sky"), tag("t2", "sea")]);
        assert_eq!(cache.len(), 2);

        cache.invalidate();
        assert!(cache.is_empty());
        assert!(!cache.is_fresh());
        assert!(cache.get("sky").is_none());
    }

    #[test]
    fn name_validity_rules() {
        assert!(is_valid_tag_name("landscape"));
        assert!(is_valid_tag_name("  trimmed  "));
        assert!(is_valid_tag_name("long_hair (blonde)"));
        assert!(!is_valid_tag_name(""));
        assert!(!is_valid_tag_name("   "));
        assert!(!is_valid_tag_name("line\nbreak"));
        assert!(!is_valid_tag_name("tab\there"));
        assert!(!is_valid_tag_name(&"x".repeat(101)));
        assert!(is_valid_tag_name(&"x".repeat(100)));
    }

    #[test]
    fn trailing_whitespace_does_not_invalidate_a_name() {
        // Trimming happens before creation, so only interior control
        // characters make a name unusable.
        assert!(is_valid_tag_name("sunset\n"));
        assert!(is_valid_tag_name("\tsunset"));
        assert!(!is_valid_tag_name("sun\nset"));
    }
}
