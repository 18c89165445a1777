//! Test support: a scriptable stand-in for the correction pipeline.
//!
//! Compiled in debug builds only. Lets tests dictate per-item delays and
//! failures, and observe how the engine drives the pipeline boundary
//! (diagnostics suppression, inference-lock serialization) without any
//! real correction math.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::decoders::{ImageBuf, StageImages};
use crate::models::Stage;
use crate::pipeline::{CorrectionPipeline, PipelineFactory, RunConfig, RunOutput};

/// Shared script controlling every pipeline instance a factory creates.
#[derive(Debug, Default)]
pub struct Script {
    /// Extra processing delay per item name.
    pub delays: HashMap<String, Duration>,
    /// Item names that fail with a scripted error.
    pub failures: HashSet<String>,
    /// Delay inside each `predict_image` call.
    pub predict_delay: Duration,
    /// Set if any run ever arrived with diagnostics still enabled.
    pub saw_diagnostics: AtomicBool,
    /// Live `predict_image` calls right now; used to observe lock overlap.
    pub predicts_in_flight: AtomicUsize,
    /// High-water mark of `predicts_in_flight`.
    pub max_concurrent_predicts: AtomicUsize,
}

impl Script {
    pub fn delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn fail(mut self, name: &str) -> Self {
        self.failures.insert(name.to_string());
        self
    }
}

/// Pipeline fake driven by a [`Script`].
pub struct ScriptedPipeline {
    script: Arc<Script>,
    trained: bool,
}

impl CorrectionPipeline for ScriptedPipeline {
    fn run(
        &mut self,
        image: &ImageBuf,
        _white: Option<&ImageBuf>,
        name: &str,
        config: &RunConfig,
    ) -> Result<RunOutput, String> {
        let diagnostics = config.settings.ffc.delta_e
            || config.settings.gc.delta_e
            || config.settings.wb.delta_e
            || config.settings.cc.delta_e
            || config.settings.ffc.show
            || config.settings.gc.show
            || config.settings.wb.show
            || config.settings.cc.show;
        if diagnostics {
            self.script.saw_diagnostics.store(true, Ordering::SeqCst);
        }

        if let Some(delay) = self.script.delays.get(name) {
            std::thread::sleep(*delay);
        }

        if self.script.failures.contains(name) {
            return Err(format!("scripted failure for {name}"));
        }

        let mut output = RunOutput::default();
        for stage in Stage::ORDER {
            if config.stages.enabled(stage) {
                output.images.insert(stage, image.clone());
            }
        }
        self.trained = config.stages.cc;
        Ok(output)
    }

    fn predict_image(&self, image: &ImageBuf) -> Result<StageImages, String> {
        let live = self.script.predicts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.script
            .max_concurrent_predicts
            .fetch_max(live, Ordering::SeqCst);

        std::thread::sleep(self.script.predict_delay);

        self.script.predicts_in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut out = StageImages::new();
        out.insert(Stage::Cc, image.clone());
        Ok(out)
    }

    fn has_trained_model(&self) -> bool {
        self.trained
    }
}

/// Factory producing [`ScriptedPipeline`] instances over one shared script.
pub struct ScriptedFactory {
    pub script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
        }
    }
}

impl PipelineFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn CorrectionPipeline> {
        Box::new(ScriptedPipeline {
            script: Arc::clone(&self.script),
            trained: false,
        })
    }
}

/// Write a tiny valid PNG so executor tests can exercise real decoding.
pub fn write_test_png(path: &Path) -> Result<(), String> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([120u8, 140, 160]));
    img.save(path)
        .map_err(|e| format!("Failed to write test image {}: {e}", path.display()))
}
