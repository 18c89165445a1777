//! Data models shared across the chromacc crates.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One step of the correction pipeline.
///
/// The declaration order here is the fixed pipeline order; output selection
/// and settings lookup both rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ffc,
    Gc,
    Wb,
    Cc,
}

impl Stage {
    /// Fixed pipeline order: flat-field, gamma, white balance, color correction.
    pub const ORDER: [Stage; 4] = [Stage::Ffc, Stage::Gc, Stage::Wb, Stage::Cc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ffc => "ffc",
            Stage::Gc => "gc",
            Stage::Wb => "wb",
            Stage::Cc => "cc",
        }
    }

    /// Parse a stage name as used by settings updates ("ffc", "gc", "wb", "cc").
    pub fn from_name(name: &str) -> Option<Stage> {
        match name {
            "ffc" => Some(Stage::Ffc),
            "gc" => Some(Stage::Gc),
            "wb" => Some(Stage::Wb),
            "cc" => Some(Stage::Cc),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fitting method for the color-correction stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionMethod {
    #[default]
    Pls,
    Nn,
    Linear,
    Svm,
    Conventional,
}

impl CorrectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionMethod::Pls => "pls",
            CorrectionMethod::Nn => "nn",
            CorrectionMethod::Linear => "linear",
            CorrectionMethod::Svm => "svm",
            CorrectionMethod::Conventional => "conventional",
        }
    }

    /// Parse a method name, rejecting anything outside the known set.
    pub fn from_name(name: &str) -> Option<CorrectionMethod> {
        match name {
            "pls" => Some(CorrectionMethod::Pls),
            "nn" => Some(CorrectionMethod::Nn),
            "linear" => Some(CorrectionMethod::Linear),
            "svm" => Some(CorrectionMethod::Svm),
            "conventional" => Some(CorrectionMethod::Conventional),
            _ => None,
        }
    }
}

impl fmt::Display for CorrectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered source image: where it lives on disk plus an optional
/// preview produced at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub filename: String,
    pub path: PathBuf,
    /// Encoded preview (data URI or similar); generation is a caller concern.
    pub preview: Option<String>,
}

impl ImageRecord {
    pub fn new(filename: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            path: path.into(),
            preview: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_pipeline_order() {
        assert_eq!(
            Stage::ORDER,
            [Stage::Ffc, Stage::Gc, Stage::Wb, Stage::Cc]
        );
    }

    #[test]
    fn test_stage_name_round_trip() {
        for stage in Stage::ORDER {
            assert_eq!(Stage::from_name(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::from_name("gamma"), None);
    }

    #[test]
    fn test_method_rejects_unknown() {
        assert_eq!(CorrectionMethod::from_name("pls"), Some(CorrectionMethod::Pls));
        assert_eq!(CorrectionMethod::from_name("ridge"), None);
    }
}
