//! Process-wide session state.
//!
//! One registry instance lives for the life of the engine and is passed
//! explicitly to whoever needs it; every mutation happens under its own
//! lock so concurrent uploads, settings updates, and batch workers never
//! observe a torn state.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::info;

use chromacc_core::models::ImageRecord;
use chromacc_core::pipeline::CorrectionPipeline;
use chromacc_core::settings::{StagePatch, StageSettings};

use crate::error::EngineError;

/// A trained pipeline instance shared for inference-only reuse.
///
/// The instance is not safe for concurrent use; callers serialize
/// `predict_image` behind this mutex and keep the critical section to
/// just the inference call.
pub type ModelHandle = Arc<Mutex<Box<dyn CorrectionPipeline>>>;

#[derive(Default)]
struct Inner {
    images: Vec<ImageRecord>,
    white_image: Option<ImageRecord>,
    settings: StageSettings,
    model: Option<ModelHandle>,
}

/// Thread-safe registry of uploaded images, the white reference, per-stage
/// settings, and the last trained model.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly registered images; ordering is registration order.
    pub fn add_images(&self, records: Vec<ImageRecord>) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.images.extend(records);
    }

    pub fn image(&self, index: usize) -> Option<ImageRecord> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.images.get(index).cloned()
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.images.clone()
    }

    pub fn image_count(&self) -> usize {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.images.len()
    }

    /// Replace the white-reference slot; last write wins.
    pub fn set_white_image(&self, record: ImageRecord) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.white_image = Some(record);
    }

    pub fn white_image(&self) -> Option<ImageRecord> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.white_image.clone()
    }

    pub fn settings(&self) -> StageSettings {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.settings.clone()
    }

    /// Merge a patch into the matching stage record.
    pub fn apply_settings_patch(&self, patch: &StagePatch) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.settings.apply(patch);
        info!(stage = %patch.stage(), "Updated stage settings");
    }

    /// Decode and merge a JSON settings update for the named stage,
    /// returning the merged settings bundle.
    pub fn update_settings_json(
        &self,
        stage_name: &str,
        value: Value,
    ) -> Result<StageSettings, EngineError> {
        let patch =
            StagePatch::from_json(stage_name, value).map_err(EngineError::InvalidSettings)?;
        self.apply_settings_patch(&patch);
        Ok(self.settings())
    }

    /// Store a freshly trained pipeline instance as the shared model.
    pub fn set_model(&self, handle: ModelHandle) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.model = Some(handle);
    }

    pub fn model(&self) -> Option<ModelHandle> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.model.clone()
    }

    /// Whether a trained model is available for inference-only reuse.
    pub fn has_trained_model(&self) -> bool {
        let handle = {
            let inner = self.inner.lock().expect("registry poisoned");
            inner.model.clone()
        };
        match handle {
            Some(model) => model.lock().expect("model poisoned").has_trained_model(),
            None => false,
        }
    }

    /// Clear every field back to empty/absent.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        *inner = Inner::default();
        info!("Session registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_images_keep_registration_order() {
        let registry = SessionRegistry::new();
        registry.add_images(vec![
            ImageRecord::new("a.png", "/tmp/a.png"),
            ImageRecord::new("b.png", "/tmp/b.png"),
        ]);
        registry.add_images(vec![ImageRecord::new("c.png", "/tmp/c.png")]);

        let names: Vec<_> = registry.images().into_iter().map(|r| r.filename).collect();
        assert_eq!(names, ["a.png", "b.png", "c.png"]);
        assert_eq!(registry.image_count(), 3);
        assert!(registry.image(3).is_none());
    }

    #[test]
    fn test_white_image_last_write_wins() {
        let registry = SessionRegistry::new();
        registry.set_white_image(ImageRecord::new("w1.png", "/tmp/w1.png"));
        registry.set_white_image(ImageRecord::new("w2.png", "/tmp/w2.png"));
        assert_eq!(registry.white_image().unwrap().filename, "w2.png");
    }

    #[test]
    fn test_settings_update_merges() {
        let registry = SessionRegistry::new();
        let merged = registry
            .update_settings_json("ffc", json!({"bins": 80}))
            .unwrap();
        assert_eq!(merged.ffc.bins, 80);
        // Unspecified fields keep their defaults
        assert_eq!(merged.ffc.smooth_window, 5);
    }

    #[test]
    fn test_settings_update_rejects_unknown_stage() {
        let registry = SessionRegistry::new();
        let err = registry
            .update_settings_json("blur", json!({}))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSettings(_)));
    }

    #[test]
    fn test_reset_clears_everything() {
        let registry = SessionRegistry::new();
        registry.add_images(vec![ImageRecord::new("a.png", "/tmp/a.png")]);
        registry.set_white_image(ImageRecord::new("w.png", "/tmp/w.png"));
        registry
            .update_settings_json("gc", json!({"max_degree": 9}))
            .unwrap();

        registry.reset();

        assert_eq!(registry.image_count(), 0);
        assert!(registry.white_image().is_none());
        assert_eq!(registry.settings(), StageSettings::default());
        assert!(!registry.has_trained_model());
    }
}
