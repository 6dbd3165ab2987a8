//! Shared fixtures for storage integration tests.

use std::sync::Arc;
use stowage_storage::{FilesystemBackend, MemoryBackend, ResponseStore};
use tempfile::TempDir;

/// A backend under test plus whatever keeps it alive.
pub struct TestBackend {
    pub store: Arc<dyn ResponseStore>,
    _dir: Option<TempDir>,
}

pub async fn filesystem() -> TestBackend {
    let dir = tempfile::tempdir().unwrap();
    let backend = FilesystemBackend::new(dir.path().join("responses"))
        .await
        .unwrap();
    TestBackend {
        store: Arc::new(backend),
        _dir: Some(dir),
    }
}

pub fn memory() -> TestBackend {
    TestBackend {
        store: Arc::new(MemoryBackend::new()),
        _dir: None,
    }
}

/// Every backend, for tests that must hold across implementations.
pub async fn all_backends() -> Vec<TestBackend> {
    vec![filesystem().await, memory()]
}
