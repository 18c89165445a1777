//! Chromacc Core Library
//!
//! Shared types for the chromacc batch color-correction engine: the
//! pipeline boundary, per-stage settings, and image decoding.

pub mod decoders;
pub mod models;
pub mod pipeline;
pub mod settings;

// Test-support fakes, compiled in debug builds only
#[cfg(debug_assertions)]
pub mod testing;

// Re-export commonly used types
pub use decoders::ImageBuf;
pub use models::{CorrectionMethod, ImageRecord, Stage};
pub use pipeline::{
    CorrectionPipeline, PipelineFactory, RunConfig, RunOutput, StageFlags, StageOutputs,
};
pub use settings::{
    CcSettings, CcSettingsPatch, FfcSettings, FfcSettingsPatch, GcSettings, GcSettingsPatch,
    StagePatch, StageSettings, WbSettings, WbSettingsPatch,
};
