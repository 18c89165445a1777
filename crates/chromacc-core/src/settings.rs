//! Per-stage pipeline settings.
//!
//! Each correction stage carries a typed settings record with serde
//! defaults. Updates arrive as patch structs whose fields are all
//! optional; applying a patch merges field by field and never replaces a
//! record wholesale, so callers can adjust one knob without knowing the
//! rest.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CorrectionMethod, Stage};

// Default functions for serde attributes
fn default_true() -> bool {
    true
}
fn default_bins() -> u32 {
    50
}
fn default_smooth_window() -> u32 {
    5
}
fn default_ffc_degree() -> u32 {
    3
}
fn default_fit_method() -> String {
    "pls".to_string()
}
fn default_max_iter() -> u32 {
    1_000
}
fn default_tol() -> f64 {
    1e-8
}
fn default_gc_max_degree() -> u32 {
    5
}
fn default_cc_degree() -> u32 {
    2
}
fn default_cc_max_iterations() -> u32 {
    10_000
}
fn default_n_samples() -> u32 {
    50
}
fn default_hidden_layers() -> Vec<u32> {
    vec![64, 32, 16]
}
fn default_learning_rate() -> f64 {
    0.001
}

/// Flat-field correction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FfcSettings {
    /// Number of histogram bins used when fitting the field model
    pub bins: u32,
    /// Smoothing window applied to the fitted field
    pub smooth_window: u32,
    /// Polynomial degree of the field fit
    pub degree: u32,
    /// Fit method name passed through to the pipeline
    pub fit_method: String,
    /// Include interaction terms in the fit
    pub interactions: bool,
    /// Iteration cap for the solver
    pub max_iter: u32,
    /// Convergence tolerance
    pub tol: f64,
    /// Random seed for reproducible fits
    pub random_seed: u64,
    /// Compute delta-E quality metrics (expensive)
    pub delta_e: bool,
    /// Generate diagnostic plots (expensive)
    pub show: bool,
}

impl Default for FfcSettings {
    fn default() -> Self {
        Self {
            bins: default_bins(),
            smooth_window: default_smooth_window(),
            degree: default_ffc_degree(),
            fit_method: default_fit_method(),
            interactions: default_true(),
            max_iter: default_max_iter(),
            tol: default_tol(),
            random_seed: 0,
            delta_e: default_true(),
            show: false,
        }
    }
}

/// Gamma correction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcSettings {
    /// Maximum polynomial degree tried when fitting the gamma curve
    pub max_degree: u32,
    pub delta_e: bool,
    pub show: bool,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            max_degree: default_gc_max_degree(),
            delta_e: default_true(),
            show: false,
        }
    }
}

/// White balance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WbSettings {
    pub delta_e: bool,
    pub show: bool,
}

impl Default for WbSettings {
    fn default() -> Self {
        Self {
            delta_e: default_true(),
            show: false,
        }
    }
}

/// Color-correction model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcSettings {
    /// Fitting method for the correction model
    pub method: CorrectionMethod,
    /// Polynomial expansion degree
    pub degree: u32,
    /// Iteration cap for the solver
    pub max_iterations: u32,
    /// Convergence tolerance
    pub tol: f64,
    /// Random seed for reproducible fits
    pub random_seed: u64,
    /// Number of patch samples used for fitting
    pub n_samples: u32,
    /// Hidden layer sizes, only used by the `nn` method
    pub hidden_layers: Vec<u32>,
    /// Learning rate, only used by the `nn` method
    pub learning_rate: f64,
    pub delta_e: bool,
    pub show: bool,
}

impl Default for CcSettings {
    fn default() -> Self {
        Self {
            method: CorrectionMethod::Pls,
            degree: default_cc_degree(),
            max_iterations: default_cc_max_iterations(),
            tol: default_tol(),
            random_seed: 0,
            n_samples: default_n_samples(),
            hidden_layers: default_hidden_layers(),
            learning_rate: default_learning_rate(),
            delta_e: default_true(),
            show: false,
        }
    }
}

/// The full per-stage settings bundle held by the session registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    pub ffc: FfcSettings,
    pub gc: GcSettings,
    pub wb: WbSettings,
    pub cc: CcSettings,
}

impl StageSettings {
    /// Copy of these settings with every expensive diagnostic disabled.
    ///
    /// Batch throughput depends on suppressing delta-E computation and plot
    /// generation per item, so the executor always runs on a suppressed
    /// copy rather than the registry's record.
    pub fn suppressed(&self) -> StageSettings {
        let mut copy = self.clone();
        copy.ffc.delta_e = false;
        copy.ffc.show = false;
        copy.gc.delta_e = false;
        copy.gc.show = false;
        copy.wb.delta_e = false;
        copy.wb.show = false;
        copy.cc.delta_e = false;
        copy.cc.show = false;
        copy
    }
}

macro_rules! merge_field {
    ($target:expr, $patch:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field.clone() {
                $target.$field = value;
            }
        )+
    };
}

/// Partial update for [`FfcSettings`]; unset fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FfcSettingsPatch {
    pub bins: Option<u32>,
    pub smooth_window: Option<u32>,
    pub degree: Option<u32>,
    pub fit_method: Option<String>,
    pub interactions: Option<bool>,
    pub max_iter: Option<u32>,
    pub tol: Option<f64>,
    pub random_seed: Option<u64>,
    pub delta_e: Option<bool>,
    pub show: Option<bool>,
}

/// Partial update for [`GcSettings`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcSettingsPatch {
    pub max_degree: Option<u32>,
    pub delta_e: Option<bool>,
    pub show: Option<bool>,
}

/// Partial update for [`WbSettings`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WbSettingsPatch {
    pub delta_e: Option<bool>,
    pub show: Option<bool>,
}

/// Partial update for [`CcSettings`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CcSettingsPatch {
    pub method: Option<CorrectionMethod>,
    pub degree: Option<u32>,
    pub max_iterations: Option<u32>,
    pub tol: Option<f64>,
    pub random_seed: Option<u64>,
    pub n_samples: Option<u32>,
    pub hidden_layers: Option<Vec<u32>>,
    pub learning_rate: Option<f64>,
    pub delta_e: Option<bool>,
    pub show: Option<bool>,
}

impl FfcSettings {
    pub fn merge(&mut self, patch: &FfcSettingsPatch) {
        merge_field!(
            self, patch, bins, smooth_window, degree, fit_method, interactions, max_iter, tol,
            random_seed, delta_e, show,
        );
    }
}

impl GcSettings {
    pub fn merge(&mut self, patch: &GcSettingsPatch) {
        merge_field!(self, patch, max_degree, delta_e, show);
    }
}

impl WbSettings {
    pub fn merge(&mut self, patch: &WbSettingsPatch) {
        merge_field!(self, patch, delta_e, show);
    }
}

impl CcSettings {
    pub fn merge(&mut self, patch: &CcSettingsPatch) {
        merge_field!(
            self, patch, method, degree, max_iterations, tol, random_seed, n_samples,
            hidden_layers, learning_rate, delta_e, show,
        );
    }
}

/// A settings patch tagged with the stage it applies to.
#[derive(Debug, Clone)]
pub enum StagePatch {
    Ffc(FfcSettingsPatch),
    Gc(GcSettingsPatch),
    Wb(WbSettingsPatch),
    Cc(CcSettingsPatch),
}

impl StagePatch {
    pub fn stage(&self) -> Stage {
        match self {
            StagePatch::Ffc(_) => Stage::Ffc,
            StagePatch::Gc(_) => Stage::Gc,
            StagePatch::Wb(_) => Stage::Wb,
            StagePatch::Cc(_) => Stage::Cc,
        }
    }

    /// Decode a patch for the named stage from a JSON object.
    ///
    /// Unknown stage names and unrecognized fields are both reported as
    /// errors so a bad update never silently drops data.
    pub fn from_json(stage_name: &str, value: Value) -> Result<StagePatch, String> {
        let stage = Stage::from_name(stage_name)
            .ok_or_else(|| format!("Unknown stage '{stage_name}' (expected ffc, gc, wb, or cc)"))?;
        let patch = match stage {
            Stage::Ffc => StagePatch::Ffc(
                serde_json::from_value(value).map_err(|e| format!("Invalid ffc settings: {e}"))?,
            ),
            Stage::Gc => StagePatch::Gc(
                serde_json::from_value(value).map_err(|e| format!("Invalid gc settings: {e}"))?,
            ),
            Stage::Wb => StagePatch::Wb(
                serde_json::from_value(value).map_err(|e| format!("Invalid wb settings: {e}"))?,
            ),
            Stage::Cc => StagePatch::Cc(
                serde_json::from_value(value).map_err(|e| format!("Invalid cc settings: {e}"))?,
            ),
        };
        Ok(patch)
    }
}

impl StageSettings {
    /// Merge a tagged patch into the matching stage record.
    pub fn apply(&mut self, patch: &StagePatch) {
        match patch {
            StagePatch::Ffc(p) => self.ffc.merge(p),
            StagePatch::Gc(p) => self.gc.merge(p),
            StagePatch::Wb(p) => self.wb.merge(p),
            StagePatch::Cc(p) => self.cc.merge(p),
        }
    }
}
