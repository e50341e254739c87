use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// `SourceUnavailable`, `GraphBuildFailed` and `ContextUnavailable` come out
/// of the processing graph; `NotAudio`, `DuplicateClip` and `Decode` come out
/// of acquisition and are recoverable (the offending clip is skipped).
#[derive(Debug, Error)]
pub enum AudioError {
    /// Tap creation refused: the playable element is already feeding a tap.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A stage-connection step failed; the graph has been rolled back to a
    /// fully-disconnected state.
    #[error("graph build failed: {0}")]
    GraphBuildFailed(String),

    /// The output subsystem cannot be created or resumed. Fatal to audio
    /// features; reported once, never retried silently.
    #[error("output context unavailable: {0}")]
    ContextUnavailable(String),

    /// Acquisition input whose declared type is not an audio type.
    #[error("not an audio clip: {0}")]
    NotAudio(String),

    /// A clip with the same display name and byte size is already in the
    /// gallery.
    #[error("clip already in gallery: {0}")]
    DuplicateClip(String),

    /// The payload claimed to be audio but could not be decoded.
    #[error("failed to decode audio: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;
