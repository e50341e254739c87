//! Signal source: wraps one playable media item and exposes its single
//! output tap.
//!
//! The underlying subsystem treats a second tap on one element as fatal, so
//! the constraint is enforced here rather than caught downstream: the element
//! carries an atomic claim, and only the source holding the claim can hand
//! out the tap.

use std::sync::Arc;

use crate::error::{AudioError, Result};
use crate::library::{MediaHandle, PlayableMedia};

/// Read access to the source's sample data for graph wiring. Cloning returns
/// the same tap, never a second one.
#[derive(Clone)]
pub struct OutputTap {
    media: Arc<PlayableMedia>,
}

impl OutputTap {
    pub fn samples(&self) -> Arc<Vec<f32>> {
        self.media.samples()
    }

    pub fn sample_rate(&self) -> u32 {
        self.media.sample_rate()
    }

    pub fn duration_seconds(&self) -> f32 {
        self.media.duration_seconds()
    }
}

pub struct SignalSource {
    media: MediaHandle,
    tap: Option<OutputTap>,
}

impl SignalSource {
    /// Wrap a playable item. No tap exists until `attach`.
    pub fn new(media: MediaHandle) -> Self {
        Self { media, tap: None }
    }

    pub fn media(&self) -> &MediaHandle {
        &self.media
    }

    /// Create (or return) the element's one output tap.
    ///
    /// Re-attaching without detaching first is a no-op returning the existing
    /// tap. If another source already claimed this element, attaching fails
    /// with `SourceUnavailable`.
    pub fn attach(&mut self) -> Result<OutputTap> {
        if let Some(tap) = &self.tap {
            return Ok(tap.clone());
        }
        if !self.media.media().claim_tap() {
            return Err(AudioError::SourceUnavailable(
                "element is already feeding a tap".into(),
            ));
        }
        let tap = OutputTap {
            media: self.media.media().clone(),
        };
        self.tap = Some(tap.clone());
        Ok(tap)
    }

    /// Release the tap. Idempotent; detaching a never-attached source is a
    /// no-op.
    pub fn detach(&mut self) {
        if self.tap.take().is_some() {
            self.media.media().release_tap();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.tap.is_some()
    }
}

impl Drop for SignalSource {
    fn drop(&mut self) {
        self.detach();
    }
}
