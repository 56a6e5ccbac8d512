//! Presence stores: the key-value view of "does this artifact exist".

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Answers whether an artifact is present. Presence of the expected path is
/// the only completion signal; content is never inspected.
pub trait PresenceStore: Send + Sync + Debug {
    /// Returns true if the artifact exists.
    fn exists(&self, path: &Path) -> bool;
}

/// Presence backed by the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemStore;

impl PresenceStore for FilesystemStore {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// In-memory presence set.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashSet<PathBuf>>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an artifact as present.
    pub fn insert(&self, path: impl Into<PathBuf>) {
        self.entries.lock().insert(path.into());
    }

    /// Marks several artifacts as present.
    pub fn extend<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.entries.lock().extend(paths.into_iter().map(Into::into));
    }

    /// Forgets an artifact.
    pub fn remove(&self, path: &Path) {
        self.entries.lock().remove(path);
    }

    /// Number of present artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PresenceStore for InMemoryStore {
    fn exists(&self, path: &Path) -> bool {
        self.entries.lock().contains(path)
    }
}
