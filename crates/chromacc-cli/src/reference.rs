//! Built-in channel-gain correction pipeline.
//!
//! A small, fully deterministic implementation of the pipeline boundary:
//! flat-field by white division, fixed-gamma decode, gray-world white
//! balance, and a per-channel gain fit for the color-correction stage.
//! Heavier fitting backends plug in behind the same traits.

use chromacc_core::decoders::{ImageBuf, StageImages};
use chromacc_core::models::Stage;
use chromacc_core::pipeline::{CorrectionPipeline, PipelineFactory, RunConfig, RunOutput};

const GAMMA: f32 = 2.2;
const MID_GRAY: f32 = 0.5;
const MIN_GAIN: f32 = 0.25;
const MAX_GAIN: f32 = 4.0;
const EPSILON: f32 = 1e-6;

pub struct ChannelGainPipeline {
    gains: Option<[f32; 3]>,
}

pub struct ChannelGainFactory;

impl PipelineFactory for ChannelGainFactory {
    fn create(&self) -> Box<dyn CorrectionPipeline> {
        Box::new(ChannelGainPipeline { gains: None })
    }
}

fn channel_means(buf: &ImageBuf) -> [f32; 3] {
    let mut sums = [0.0f64; 3];
    for pixel in buf.data.chunks_exact(3) {
        sums[0] += pixel[0] as f64;
        sums[1] += pixel[1] as f64;
        sums[2] += pixel[2] as f64;
    }
    let n = buf.pixel_count().max(1) as f64;
    [
        (sums[0] / n) as f32,
        (sums[1] / n) as f32,
        (sums[2] / n) as f32,
    ]
}

fn apply_gains(buf: &ImageBuf, gains: [f32; 3]) -> ImageBuf {
    let data = buf
        .data
        .chunks_exact(3)
        .flat_map(|pixel| {
            [
                (pixel[0] * gains[0]).clamp(0.0, 1.0),
                (pixel[1] * gains[1]).clamp(0.0, 1.0),
                (pixel[2] * gains[2]).clamp(0.0, 1.0),
            ]
        })
        .collect();
    ImageBuf {
        width: buf.width,
        height: buf.height,
        data,
    }
}

/// Divide out the illumination field. With a matching-size white frame the
/// division is per pixel; otherwise the white's channel means are used.
fn flat_field(image: &ImageBuf, white: &ImageBuf) -> ImageBuf {
    if image.width == white.width && image.height == white.height {
        let data = image
            .data
            .iter()
            .zip(&white.data)
            .map(|(v, w)| (v / w.max(EPSILON)).clamp(0.0, 1.0))
            .collect();
        ImageBuf {
            width: image.width,
            height: image.height,
            data,
        }
    } else {
        let means = channel_means(white);
        let gains = [
            1.0 / means[0].max(EPSILON),
            1.0 / means[1].max(EPSILON),
            1.0 / means[2].max(EPSILON),
        ];
        apply_gains(image, gains)
    }
}

fn gamma_decode(buf: &ImageBuf) -> ImageBuf {
    let data = buf
        .data
        .iter()
        .map(|v| v.max(0.0).powf(1.0 / GAMMA))
        .collect();
    ImageBuf {
        width: buf.width,
        height: buf.height,
        data,
    }
}

/// Gray-world gains: scale red and blue so their means match green.
fn gray_world_gains(means: [f32; 3]) -> [f32; 3] {
    let reference = means[1].max(EPSILON);
    [
        (reference / means[0].max(EPSILON)).clamp(MIN_GAIN, MAX_GAIN),
        1.0,
        (reference / means[2].max(EPSILON)).clamp(MIN_GAIN, MAX_GAIN),
    ]
}

/// Per-channel gains pulling every channel mean toward mid-gray.
fn mid_gray_gains(means: [f32; 3]) -> [f32; 3] {
    [
        (MID_GRAY / means[0].max(EPSILON)).clamp(MIN_GAIN, MAX_GAIN),
        (MID_GRAY / means[1].max(EPSILON)).clamp(MIN_GAIN, MAX_GAIN),
        (MID_GRAY / means[2].max(EPSILON)).clamp(MIN_GAIN, MAX_GAIN),
    ]
}

fn spread_metric(means: [f32; 3]) -> f64 {
    let avg = (means[0] + means[1] + means[2]) / 3.0;
    let spread =
        ((means[0] - avg).abs() + (means[1] - avg).abs() + (means[2] - avg).abs()) / 3.0;
    spread as f64
}

impl CorrectionPipeline for ChannelGainPipeline {
    fn run(
        &mut self,
        image: &ImageBuf,
        white: Option<&ImageBuf>,
        name: &str,
        config: &RunConfig,
    ) -> Result<RunOutput, String> {
        let mut current = image.clone();
        let mut output = RunOutput::default();

        if config.stages.ffc {
            let white = white.ok_or_else(|| {
                format!("Flat-field correction for {name} requires a white reference")
            })?;
            current = flat_field(&current, white);
            output.images.insert(Stage::Ffc, current.clone());
        }

        if config.stages.gc {
            current = gamma_decode(&current);
            output.images.insert(Stage::Gc, current.clone());
        }

        if config.stages.wb {
            let before = channel_means(&current);
            current = apply_gains(&current, gray_world_gains(before));
            if config.settings.wb.delta_e {
                let mut metrics = std::collections::BTreeMap::new();
                metrics.insert("channel_spread_before".to_string(), spread_metric(before));
                metrics.insert(
                    "channel_spread_after".to_string(),
                    spread_metric(channel_means(&current)),
                );
                output.metrics.insert(Stage::Wb, metrics);
            }
            output.images.insert(Stage::Wb, current.clone());
        }

        if config.stages.cc {
            let before = channel_means(&current);
            let gains = mid_gray_gains(before);
            current = apply_gains(&current, gains);
            self.gains = Some(gains);
            if config.settings.cc.delta_e {
                let mut metrics = std::collections::BTreeMap::new();
                metrics.insert("gain_r".to_string(), gains[0] as f64);
                metrics.insert("gain_g".to_string(), gains[1] as f64);
                metrics.insert("gain_b".to_string(), gains[2] as f64);
                output.metrics.insert(Stage::Cc, metrics);
            }
            output.images.insert(Stage::Cc, current);
        }

        Ok(output)
    }

    fn predict_image(&self, image: &ImageBuf) -> Result<StageImages, String> {
        let gains = self
            .gains
            .ok_or_else(|| "No trained correction model".to_string())?;
        let mut out = StageImages::new();
        out.insert(Stage::Cc, apply_gains(image, gains));
        Ok(out)
    }

    fn has_trained_model(&self) -> bool {
        self.gains.is_some()
    }
}
