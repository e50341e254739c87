//! In-memory clip gallery and acquisition intake.
//!
//! Acquisition hands over `{display_name, byte_size, mime_type, payload}`;
//! anything whose declared type is not an audio type is rejected and skipped.
//! The gallery keys items by UUID, detects duplicates by display name + byte
//! size, and owns each decoded payload until the item is removed. A selected
//! clip keeps its payload alive through its `MediaHandle` even after removal
//! from the list — the payload is freed exactly once, when the last reference
//! drops.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audio::{decode_bytes, decode_file};
use crate::error::{AudioError, Result};

/// Metadata as delivered by the acquisition collaborator.
#[derive(Debug, Clone)]
pub struct ClipMeta {
    pub display_name: String,
    pub byte_size: u64,
    pub mime_type: String,
}

/// One playable element. Created fresh per selection; the single-tap
/// constraint lives here (`claim_tap` / `release_tap`).
pub struct PlayableMedia {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    duration_seconds: f32,
    tapped: AtomicBool,
}

impl PlayableMedia {
    pub fn samples(&self) -> Arc<Vec<f32>> {
        self.samples.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_seconds(&self) -> f32 {
        self.duration_seconds
    }

    /// Claim the element's one tap. Returns false if it is already claimed.
    pub(crate) fn claim_tap(&self) -> bool {
        !self.tapped.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_tap(&self) {
        self.tapped.store(false, Ordering::Release);
    }
}

/// Opaque reference to a decodable audio source. Replaced wholesale when the
/// selected clip changes; never mutated in place.
#[derive(Clone)]
pub struct MediaHandle {
    id: Uuid,
    inner: Arc<PlayableMedia>,
}

impl MediaHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn duration_seconds(&self) -> f32 {
        self.inner.duration_seconds
    }

    pub(crate) fn media(&self) -> &Arc<PlayableMedia> {
        &self.inner
    }
}

/// Gallery row for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipSummary {
    pub id: Uuid,
    pub display_name: String,
    pub byte_size: u64,
    pub mime_type: String,
    pub duration_seconds: f32,
    pub selected: bool,
}

struct StoredClip {
    id: Uuid,
    meta: ClipMeta,
    imported_at: DateTime<Utc>,
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    duration_seconds: f32,
}

struct LibraryInner {
    items: Vec<StoredClip>,
    selected: Option<Uuid>,
    target_rate: u32,
}

/// The in-memory gallery.
#[derive(Clone)]
pub struct MediaLibrary {
    inner: Arc<Mutex<LibraryInner>>,
}

impl MediaLibrary {
    pub fn new(target_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LibraryInner {
                items: Vec::new(),
                selected: None,
                target_rate,
            })),
        }
    }

    /// Import a clip from the filesystem. The MIME type is derived from the
    /// file extension the way the acquisition side declares it.
    pub fn import_file(&self, path: &Path) -> Result<Uuid> {
        let display_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clip")
            .to_string();
        let byte_size = std::fs::metadata(path)
            .map_err(|e| AudioError::Decode(format!("failed to stat clip file: {}", e)))?
            .len();
        let mime_type = mime_for_extension(path.extension().and_then(|e| e.to_str()));

        let meta = ClipMeta {
            display_name,
            byte_size,
            mime_type,
        };
        self.check_acceptable(&meta)?;

        let target_rate = self.inner.lock().expect("media library poisoned").target_rate;
        let decoded = decode_file(path, target_rate)?;
        self.store(meta, decoded.samples, decoded.sample_rate)
    }

    /// Add a clip delivered as an in-memory payload.
    pub fn add_clip(&self, meta: ClipMeta, payload: Vec<u8>) -> Result<Uuid> {
        self.check_acceptable(&meta)?;

        let extension = Path::new(&meta.display_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_string());
        let target_rate = self.inner.lock().expect("media library poisoned").target_rate;
        let decoded = decode_bytes(payload, extension.as_deref(), target_rate)?;
        self.store(meta, decoded.samples, decoded.sample_rate)
    }

    fn check_acceptable(&self, meta: &ClipMeta) -> Result<()> {
        if !meta.mime_type.starts_with("audio/") {
            return Err(AudioError::NotAudio(format!(
                "\"{}\" declares type {}",
                meta.display_name, meta.mime_type
            )));
        }
        let inner = self.inner.lock().expect("media library poisoned");
        let duplicate = inner
            .items
            .iter()
            .any(|i| i.meta.display_name == meta.display_name && i.meta.byte_size == meta.byte_size);
        if duplicate {
            return Err(AudioError::DuplicateClip(meta.display_name.clone()));
        }
        Ok(())
    }

    fn store(&self, meta: ClipMeta, samples: Vec<f32>, sample_rate: u32) -> Result<Uuid> {
        let duration_seconds = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f32 / sample_rate as f32
        };
        let id = Uuid::new_v4();
        log::info!(
            "[library] added \"{}\" ({} bytes, {:.2}s)",
            meta.display_name,
            meta.byte_size,
            duration_seconds
        );
        let mut inner = self.inner.lock().expect("media library poisoned");
        inner.items.push(StoredClip {
            id,
            meta,
            imported_at: Utc::now(),
            samples: Arc::new(samples),
            sample_rate,
            duration_seconds,
        });
        Ok(id)
    }

    /// Remove an item. Clears the selection if the removed item was selected;
    /// the gallery's reference to the decoded payload is dropped here, but any
    /// live `MediaHandle` keeps the payload alive until it is released.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().expect("media library poisoned");
        let before = inner.items.len();
        inner.items.retain(|i| i.id != id);
        let removed = inner.items.len() != before;
        if removed && inner.selected == Some(id) {
            inner.selected = None;
        }
        removed
    }

    /// Select an item (or deselect with `None`) and build a fresh playable
    /// handle for it.
    pub fn select(&self, id: Option<Uuid>) -> Result<Option<MediaHandle>> {
        let mut inner = self.inner.lock().expect("media library poisoned");
        match id {
            None => {
                inner.selected = None;
                Ok(None)
            }
            Some(id) => {
                let item = inner
                    .items
                    .iter()
                    .find(|i| i.id == id)
                    .ok_or_else(|| AudioError::SourceUnavailable(format!("no clip {}", id)))?;
                let handle = MediaHandle {
                    id: item.id,
                    inner: Arc::new(PlayableMedia {
                        samples: item.samples.clone(),
                        sample_rate: item.sample_rate,
                        duration_seconds: item.duration_seconds,
                        tapped: AtomicBool::new(false),
                    }),
                };
                inner.selected = Some(id);
                Ok(Some(handle))
            }
        }
    }

    pub fn selected_id(&self) -> Option<Uuid> {
        self.inner.lock().expect("media library poisoned").selected
    }

    pub fn summaries(&self) -> Vec<ClipSummary> {
        let inner = self.inner.lock().expect("media library poisoned");
        inner
            .items
            .iter()
            .map(|i| ClipSummary {
                id: i.id,
                display_name: i.meta.display_name.clone(),
                byte_size: i.meta.byte_size,
                mime_type: i.meta.mime_type.clone(),
                duration_seconds: i.duration_seconds,
                selected: inner.selected == Some(i.id),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("media library poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest-first import order, for display.
    pub fn imported_at(&self, id: Uuid) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().expect("media library poisoned");
        inner.items.iter().find(|i| i.id == id).map(|i| i.imported_at)
    }
}

fn mime_for_extension(extension: Option<&str>) -> String {
    match extension.map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("aac") => "audio/aac",
        Some("m4a") => "audio/mp4",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
    .to_string()
}
