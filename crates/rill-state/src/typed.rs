//! Typed view over a [`KeyValueStore`] through record codecs.

use std::sync::Arc;

use rill_core::Codec;

use crate::error::StateResult;
use crate::store::KeyValueStore;

/// A [`KeyValueStore`] seen through a key codec and a value codec.
///
/// Cloning is cheap; every clone reads and writes the same store.
pub struct TypedStore<K, V> {
    store: Arc<KeyValueStore>,
    keys: Arc<dyn Codec<K>>,
    values: Arc<dyn Codec<V>>,
}

impl<K, V> Clone for TypedStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: Arc::clone(&self.keys),
            values: Arc::clone(&self.values),
        }
    }
}

impl<K, V> TypedStore<K, V> {
    pub fn new(
        store: Arc<KeyValueStore>,
        keys: impl Codec<K> + 'static,
        values: impl Codec<V> + 'static,
    ) -> Self {
        Self {
            store,
            keys: Arc::new(keys),
            values: Arc::new(values),
        }
    }

    pub fn inner(&self) -> &Arc<KeyValueStore> {
        &self.store
    }

    /// Current value and version for `key`.
    pub fn get_versioned(&self, key: &K) -> StateResult<Option<(V, u64)>> {
        match self.store.get(&self.keys.encode(key))? {
            Some(entry) => Ok(Some((self.values.decode(&entry.value)?, entry.version))),
            None => Ok(None),
        }
    }

    pub fn get(&self, key: &K) -> StateResult<Option<V>> {
        Ok(self.get_versioned(key)?.map(|(value, _)| value))
    }

    /// See [`KeyValueStore::put`].
    pub fn put(&self, key: &K, value: &V, version: u64) -> StateResult<bool> {
        self.store
            .put(&self.keys.encode(key), &self.values.encode(value), version)
    }

    /// Decoded snapshot of every entry, in encoded-key order.
    pub fn entries(&self) -> StateResult<Vec<(K, V)>> {
        self.store
            .iter()?
            .map(|(key, entry)| Ok((self.keys.decode(&key)?, self.values.decode(&entry.value)?)))
            .collect()
    }
}
