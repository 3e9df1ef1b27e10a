//! Lifecycle of generated image bytes.
//!
//! The pipeline hands back a [`GeneratedArtifact`] whose handle resolves to
//! bytes held in an [`ArtifactStore`]. Bytes stay alive until the caller
//! releases the handle; an [`ArtifactSlot`] releases the previous image of a
//! "current image" slot whenever a new one replaces it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

const HANDLE_PREFIX: &str = "blob:imagine/";

/// Opaque, caller-addressable reference to stored image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ArtifactHandle(String);

impl ArtifactHandle {
    fn generate() -> Self {
        Self(format!("{}{}", HANDLE_PREFIX, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedArtifact {
    pub handle: ArtifactHandle,
    pub mime_type: &'static str,
    pub size_bytes: usize,
    pub model: String,
    pub seed: Option<u64>,
}

impl GeneratedArtifact {
    pub fn extension(&self) -> &'static str {
        match self.mime_type {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            "image/png" => "png",
            _ => "bin",
        }
    }
}

/// Holds the bytes behind every live handle.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    entries: Mutex<HashMap<ArtifactHandle, Arc<[u8]>>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn materialize(&self, bytes: Vec<u8>, model: &str, seed: Option<u64>) -> GeneratedArtifact {
        let handle = ArtifactHandle::generate();
        let artifact = GeneratedArtifact {
            handle: handle.clone(),
            mime_type: sniff_mime(&bytes),
            size_bytes: bytes.len(),
            model: model.to_string(),
            seed,
        };
        self.entries().insert(handle, Arc::from(bytes));
        log::debug!(
            "Materialized {} ({}, {} bytes)",
            artifact.handle,
            artifact.mime_type,
            artifact.size_bytes
        );
        artifact
    }

    pub fn resolve(&self, handle: &ArtifactHandle) -> Option<Arc<[u8]>> {
        self.entries().get(handle).cloned()
    }

    /// Base64 `data:` URL for the handle, for embedding in markup.
    pub fn data_url(&self, artifact: &GeneratedArtifact) -> Option<String> {
        let bytes = self.resolve(&artifact.handle)?;
        Some(format!(
            "data:{};base64,{}",
            artifact.mime_type,
            STANDARD.encode(bytes.as_ref())
        ))
    }

    /// Drops the bytes behind `artifact`. Returns `false` if already released.
    pub fn release(&self, artifact: &GeneratedArtifact) -> bool {
        let released = self.entries().remove(&artifact.handle).is_some();
        if released {
            log::debug!("Released {}", artifact.handle);
        }
        released
    }

    pub fn live_count(&self) -> usize {
        self.entries().len()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ArtifactHandle, Arc<[u8]>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The single "current image" of a caller's session.
pub struct ArtifactSlot {
    store: Arc<ArtifactStore>,
    current: Mutex<Option<GeneratedArtifact>>,
}

impl ArtifactSlot {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<GeneratedArtifact> {
        self.lock().clone()
    }

    /// Installs `artifact` and releases whatever the slot held before.
    pub fn replace(&self, artifact: GeneratedArtifact) -> Option<GeneratedArtifact> {
        let previous = self.lock().replace(artifact);
        if let Some(old) = &previous {
            self.store.release(old);
        }
        previous
    }

    pub fn clear(&self) {
        if let Some(old) = self.lock().take() {
            self.store.release(&old);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<GeneratedArtifact>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ArtifactSlot {
    fn drop(&mut self) {
        self.clear();
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "application/octet-stream",
    }
}
