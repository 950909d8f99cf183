//! Cache of default contexts keyed by request shape

use crate::context::StorageContext;
use crate::options::ContextFingerprint;
use parking_lot::Mutex;
use tracing::debug;

/// Holds the contexts resolved for the last default request
///
/// Only one fingerprint is kept; a request with a different shape
/// replaces the entry.
#[derive(Default)]
pub struct DefaultContextCache {
    slot: Mutex<Option<(ContextFingerprint, Vec<StorageContext>)>>,
}

impl DefaultContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached contexts for `fingerprint`, if the shape matches
    pub fn get(&self, fingerprint: &ContextFingerprint) -> Option<Vec<StorageContext>> {
        match &*self.slot.lock() {
            Some((cached, contexts)) if cached == fingerprint => Some(contexts.clone()),
            _ => None,
        }
    }

    pub fn put(&self, fingerprint: ContextFingerprint, contexts: Vec<StorageContext>) {
        debug!(contexts = contexts.len(), "caching default contexts");
        *self.slot.lock() = Some((fingerprint, contexts));
    }

    /// Contexts of whatever is cached
    pub fn current(&self) -> Option<Vec<StorageContext>> {
        self.slot.lock().as_ref().map(|(_, contexts)| contexts.clone())
    }

    pub fn invalidate(&self) {
        if self.slot.lock().take().is_some() {
            debug!("default contexts invalidated");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::options::{resolve_effective_options, StorageOptions};

    #[tokio::test]
    async fn test_shape_must_match() {
        let network = MemoryNetwork::new();
        network.add_provider("a");
        network.add_provider("b");
        let services = network.services("0x00000000000000000000000000000000000000aa");

        let plain = resolve_effective_options(&StorageOptions::default(), &StorageOptions::default());
        let tagged = resolve_effective_options(
            &StorageOptions::default().with_metadata("app", "x"),
            &StorageOptions::default(),
        );
        let contexts = StorageContext::create_many(&services, &plain).await.unwrap();

        let cache = DefaultContextCache::new();
        assert!(cache.is_empty());
        cache.put(plain.fingerprint().unwrap(), contexts);

        assert_eq!(cache.get(&plain.fingerprint().unwrap()).unwrap().len(), 2);
        assert!(cache.get(&tagged.fingerprint().unwrap()).is_none());
        assert_eq!(cache.current().unwrap().len(), 2);

        cache.invalidate();
        assert!(cache.get(&plain.fingerprint().unwrap()).is_none());
        assert!(cache.current().is_none());
    }
}
