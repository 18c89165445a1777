//! Engine error taxonomy.
//!
//! Only admission and validation problems surface as errors to the
//! submitting caller; per-item failures are recorded in the batch state
//! and never abort a running batch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A batch is already running; nothing was started.
    #[error("Batch {batch_id} is already in progress")]
    BatchActive { batch_id: String },

    /// No images have been registered yet.
    #[error("No images loaded")]
    NoImages,

    /// Every requested index was out of range.
    #[error("No valid images to process")]
    NoValidIndices,

    /// A single-image operation named an index that does not exist.
    #[error("Invalid image index {0}")]
    InvalidIndex(usize),

    /// The requested correction method is not in the known set.
    #[error("Invalid method '{0}'. Must be one of: pls, nn, linear, svm, conventional")]
    InvalidMethod(String),

    /// Inference-only application requires a previously trained model.
    #[error("No trained model available. Run correction on at least one image first.")]
    NoTrainedModel,

    /// Bad settings update (unknown stage, unrecognized field).
    #[error("Invalid settings update: {0}")]
    InvalidSettings(String),

    /// The worker pool could not be constructed.
    #[error("Failed to build worker pool: {0}")]
    PoolBuild(String),

    /// A synchronous single-image run failed.
    #[error("Processing failed: {0}")]
    Processing(String),
}

impl EngineError {
    /// Conflict errors map to a 409 at an HTTP edge; everything else in
    /// this enum is a 400-class validation failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::BatchActive { .. })
    }
}
