//! The correction pipeline boundary.
//!
//! The actual correction math lives behind [`CorrectionPipeline`]; the
//! engine only ever drives it through this trait. A fresh instance is
//! created per item via [`PipelineFactory`] because training mutates the
//! instance. A trained instance can afterwards be reused for
//! inference-only application, but it is not safe for concurrent use, so
//! callers serialize `predict_image` behind a lock.

use std::collections::BTreeMap;

use crate::decoders::{ImageBuf, StageImages};
use crate::models::{CorrectionMethod, Stage};
use crate::settings::StageSettings;

/// Which pipeline stages to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageFlags {
    pub ffc: bool,
    pub gc: bool,
    pub wb: bool,
    pub cc: bool,
}

impl StageFlags {
    pub fn any(&self) -> bool {
        self.ffc || self.gc || self.wb || self.cc
    }

    pub fn enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Ffc => self.ffc,
            Stage::Gc => self.gc,
            Stage::Wb => self.wb,
            Stage::Cc => self.cc,
        }
    }
}

/// Everything one pipeline invocation needs besides the image itself.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub stages: StageFlags,
    pub method: CorrectionMethod,
    pub settings: StageSettings,
}

impl RunConfig {
    pub fn new(stages: StageFlags, method: CorrectionMethod, settings: StageSettings) -> Self {
        Self {
            stages,
            method,
            settings,
        }
    }

    /// Deep copy with expensive diagnostics forced off, for batch runs.
    pub fn suppressed(&self) -> RunConfig {
        RunConfig {
            stages: self.stages,
            method: self.method,
            settings: self.settings.suppressed(),
        }
    }
}

/// Per-stage quality metrics (delta-E summaries and the like), keyed by
/// metric name. Empty when diagnostics are suppressed.
pub type StageMetrics = BTreeMap<Stage, BTreeMap<String, f64>>;

/// Corrected stage outputs, metrics, and an optional non-fatal warning.
pub type StageOutputs = StageImages;

#[derive(Debug, Default)]
pub struct RunOutput {
    pub metrics: StageMetrics,
    pub images: StageOutputs,
    pub warning: Option<String>,
}

impl RunOutput {
    /// The image representing "the" corrected result when several stages
    /// produced output: the last present stage in fixed FFC, GC, WB, CC
    /// order, each later match overwriting the earlier one.
    pub fn final_corrected(&self) -> Option<(Stage, &ImageBuf)> {
        let mut found = None;
        for stage in Stage::ORDER {
            if let Some(img) = self.images.get(&stage) {
                found = Some((stage, img));
            }
        }
        found
    }
}

/// One correction pipeline instance.
///
/// `run` fits stage models against the given image and returns corrected
/// outputs; it mutates internal state, so instances are never shared
/// between concurrent training runs. `predict_image` applies the already
/// fitted models without refitting.
pub trait CorrectionPipeline: Send {
    fn run(
        &mut self,
        image: &ImageBuf,
        white: Option<&ImageBuf>,
        name: &str,
        config: &RunConfig,
    ) -> Result<RunOutput, String>;

    fn predict_image(&self, image: &ImageBuf) -> Result<StageImages, String>;

    fn has_trained_model(&self) -> bool;
}

/// Creates fresh pipeline instances, one per work item.
pub trait PipelineFactory: Send + Sync {
    fn create(&self) -> Box<dyn CorrectionPipeline>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(tag: f32) -> ImageBuf {
        ImageBuf {
            width: 1,
            height: 1,
            data: vec![tag, tag, tag],
        }
    }

    #[test]
    fn test_final_corrected_prefers_last_stage_in_order() {
        let mut output = RunOutput::default();
        output.images.insert(Stage::Ffc, buf(0.1));
        output.images.insert(Stage::Wb, buf(0.3));

        let (stage, img) = output.final_corrected().unwrap();
        assert_eq!(stage, Stage::Wb);
        assert_eq!(img.data[0], 0.3);
    }

    #[test]
    fn test_final_corrected_cc_wins_over_everything() {
        let mut output = RunOutput::default();
        for stage in Stage::ORDER {
            output.images.insert(stage, buf(0.5));
        }
        assert_eq!(output.final_corrected().unwrap().0, Stage::Cc);
    }

    #[test]
    fn test_final_corrected_empty() {
        assert!(RunOutput::default().final_corrected().is_none());
    }

    #[test]
    fn test_suppressed_config_keeps_flags_and_method() {
        let config = RunConfig::new(
            StageFlags {
                cc: true,
                ..Default::default()
            },
            CorrectionMethod::Nn,
            StageSettings::default(),
        );
        let batch = config.suppressed();
        assert!(batch.stages.cc);
        assert_eq!(batch.method, CorrectionMethod::Nn);
        assert!(!batch.settings.cc.delta_e);
    }
}
