//! Kernel-side store of declared library requirements.
//!
//! The store is the single source of truth for which libraries are
//! configured; the frontend's cumulative `require.config` state is derived
//! from it and may lag until the next config send. It survives frontend
//! reloads; only channels are rebuilt.

use indexmap::IndexMap;
use log::warn;

use crate::protocol::ConfigPayload;

/// Declared library paths and shims, in insertion order.
///
/// Keys are unique per map; values need not be. Insertion order carries no
/// semantic weight but keeps diagnostics and outgoing config messages
/// reproducible.
#[derive(Debug, Clone, Default)]
pub struct RequireStore {
    paths: IndexMap<String, String>,
    shims: IndexMap<String, Vec<String>>,
}

impl RequireStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `paths` and `shims` into the stored state. Later keys
    /// overwrite earlier values; existing keys keep their original
    /// position.
    pub fn merge(
        &mut self,
        paths: IndexMap<String, String>,
        shims: IndexMap<String, Vec<String>>,
    ) {
        self.paths.extend(paths);
        self.shims.extend(shims);
    }

    /// Remove `key` from both maps. Returns false if the key was declared
    /// in neither map.
    ///
    /// The frontend is deliberately not notified here: removal cannot
    /// un-define an already-loaded module on the frontend side, so the two
    /// states converge again at the next config send.
    pub fn pop(&mut self, key: &str) -> bool {
        let path = self.paths.shift_remove(key);
        let shim = self.shims.shift_remove(key);
        if path.is_none() && shim.is_none() {
            return false;
        }
        warn!(
            "[store] `{}` removed from kernel-side requirements; the frontend keeps \
             its definition until the next config message",
            key
        );
        true
    }

    /// Copy of the path mapping. Never the live map.
    pub fn libs(&self) -> IndexMap<String, String> {
        self.paths.clone()
    }

    /// Copy of the shim mapping. Never the live map.
    pub fn shims(&self) -> IndexMap<String, Vec<String>> {
        self.shims.clone()
    }

    /// Declared library keys, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.paths.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.shims.is_empty()
    }

    pub fn clear(&mut self) {
        self.paths.clear();
        self.shims.clear();
    }

    /// The full current state as one atomic config message.
    pub fn snapshot(&self) -> ConfigPayload {
        ConfigPayload {
            paths: self.paths.clone(),
            shim: self.shims.clone(),
        }
    }
}
