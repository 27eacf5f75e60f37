use crate::models::Document;
use std::time::{Duration, Instant};

/// Time-bounded memo of the last document seen on disk or written to it.
#[derive(Debug)]
pub struct DocumentCache {
    document: Option<Document>,
    stored_at: Option<Instant>,
    ttl: Duration,
    version: u64,
}

impl DocumentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            document: None,
            stored_at: None,
            ttl,
            version: 0,
        }
    }

    /// The cached document, if it is younger than the freshness window.
    pub fn fresh(&self) -> Option<&Document> {
        let stored_at = self.stored_at?;
        if stored_at.elapsed() < self.ttl {
            self.document.as_ref()
        } else {
            None
        }
    }

    /// Whatever was cached last, regardless of age.
    pub fn last_good(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Records a document that was just persisted.
    pub fn store(&mut self, document: Document) {
        self.document = Some(document);
        self.stored_at = Some(Instant::now());
        self.version += 1;
    }

    /// Records a document loaded from disk, unless a write landed after `seen_version`
    /// was observed. Returns the document the cache now holds.
    pub fn store_loaded(&mut self, document: Document, seen_version: u64) -> Document {
        if self.version != seen_version {
            if let Some(newer) = &self.document {
                return newer.clone();
            }
        }
        self.store(document.clone());
        document
    }

    pub fn invalidate(&mut self) {
        self.stored_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::DocumentCache;
    use crate::models::{Document, Note};
    use chrono::Utc;
    use std::time::Duration;

    fn document_with(title: &str) -> Document {
        Document {
            notes: vec![Note::new(Some(title.to_string()), None, Utc::now())],
            trash: Vec::new(),
        }
    }

    #[test]
    fn fresh_respects_the_window() {
        let mut cache = DocumentCache::new(Duration::from_secs(60));
        assert!(cache.fresh().is_none());
        cache.store(document_with("a"));
        assert!(cache.fresh().is_some());

        let mut expired = DocumentCache::new(Duration::ZERO);
        expired.store(document_with("a"));
        assert!(expired.fresh().is_none());
        assert!(expired.last_good().is_some());
    }

    #[test]
    fn stale_load_does_not_clobber_newer_write() {
        let mut cache = DocumentCache::new(Duration::from_secs(60));
        let seen = cache.version();
        cache.store(document_with("written"));

        let held = cache.store_loaded(document_with("loaded"), seen);
        assert_eq!(held.notes[0].title.as_deref(), Some("written"));
        assert_eq!(
            cache.last_good().and_then(|doc| doc.notes[0].title.clone()).as_deref(),
            Some("written")
        );
    }

    #[test]
    fn invalidate_keeps_last_good() {
        let mut cache = DocumentCache::new(Duration::from_secs(60));
        cache.store(document_with("a"));
        cache.invalidate();
        assert!(cache.fresh().is_none());
        assert!(cache.last_good().is_some());
    }
}
