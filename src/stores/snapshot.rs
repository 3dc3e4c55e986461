use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// A map whose contents are only ever replaced wholesale. Readers take the
/// current `Arc` and keep a consistent view for as long as they hold it; a
/// concurrent replace never mutates a published snapshot.
pub struct SnapshotMap<K, V> {
    inner: RwLock<Arc<HashMap<K, V>>>,
}

impl<K: Eq + Hash, V: Clone> SnapshotMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// The current snapshot.
    pub fn load(&self) -> Arc<HashMap<K, V>> {
        self.inner.read().expect("snapshot lock poisoned").clone()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.load().get(key).cloned()
    }

    /// Publish a new snapshot.
    pub fn replace(&self, data: HashMap<K, V>) {
        *self.inner.write().expect("snapshot lock poisoned") = Arc::new(data);
    }
}
